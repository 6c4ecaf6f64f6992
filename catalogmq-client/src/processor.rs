use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Handles the entities a [`Consumer`](crate::Consumer) receives.
///
/// It runs on the poll loop task, the next receive waits until it returns. A returned error is
/// logged by the consumer, which then carries on with the next message.
#[async_trait]
pub trait Processor<E>: Send + Sync {
    async fn process(&self, entity: E) -> Result<()>;
}

/// [`Processor`] made of a plain closure.
pub struct FnProcessor<F>(F);

#[async_trait]
impl<E, F> Processor<E> for FnProcessor<F>
where
    E: Send + 'static,
    F: Fn(E) -> Result<()> + Send + Sync,
{
    async fn process(&self, entity: E) -> Result<()> {
        (self.0)(entity)
    }
}

/// Wrap a closure as a shareable processor.
///
/// ```
/// use catalogmq_client::{processor_fn, Processor};
///
/// let processor = processor_fn(|name: String| {
///     println!("Got {name}");
///     Ok(())
/// });
/// # let _: std::sync::Arc<dyn Processor<String>> = processor;
/// ```
pub fn processor_fn<E, F>(f: F) -> Arc<dyn Processor<E>>
where
    E: Send + 'static,
    F: Fn(E) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}
