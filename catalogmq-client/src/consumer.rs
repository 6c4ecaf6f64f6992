//! Consumer lifecycle.
//!
//! A consumer is `Idle` until it is started, `Running` while its poll loop task lives and
//! `Stopped` after the loop finished and all broker handles have been released. Starting a
//! stopped consumer begins a new run with a fresh connection.
//!
//! The poll loop and the controlling side share two things only: the cancellation token of the
//! run, which plays the running flag, and the broker handles of the run, which are kept behind a
//! mutex so that `stop()` can release them even if the loop task had to be aborted.
use crate::broker::ConnectionProvider;
use crate::config::{ConsumerBehavior, QueueConfig};
use crate::error::ConnectionError;
use crate::message::Message;
use crate::processor::Processor;
use crate::resources::Handles;
use async_trait::async_trait;
use catalogmq_codec::{Codec, SerializationError};
use futures::FutureExt;
use log::{debug, error, info, trace, warn};
use serde_derive::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Running,
    Stopped,
}

/// One start-to-stop cycle of the poll loop.
struct Run {
    id: u64,
    running: CancellationToken,
    task: JoinHandle<()>,
    handles: Arc<tokio::sync::Mutex<Handles>>,
}

struct Lifecycle {
    state: ConsumerState,
    /// Id of the latest run, only that one may change the state.
    last_run: u64,
    current: Option<Run>,
}

struct Inner<E> {
    provider: Arc<dyn ConnectionProvider>,
    codec: Arc<dyn Codec<E>>,
    processor: Arc<dyn Processor<E>>,
    queue: QueueConfig,
    lifecycle: Mutex<Lifecycle>,
}

/// Receives entities of type `E` from a queue and passes them to a [`Processor`].
pub struct Consumer<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Consumer<E> {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        codec: Arc<dyn Codec<E>>,
        processor: Arc<dyn Processor<E>>,
        queue: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                codec,
                processor,
                queue,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConsumerState::Idle,
                    last_run: 0,
                    current: None,
                }),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue.name
    }

    pub fn behavior(&self) -> ConsumerBehavior {
        self.inner.queue.behavior
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.lifecycle().state
    }
}

impl<E: Send + 'static> Consumer<E> {
    /// Spawn the poll loop. It must be called from within a tokio runtime.
    ///
    /// Does nothing but warn if the consumer is already running.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();

        if lifecycle.state == ConsumerState::Running {
            warn!("Consumer of queue {} is already running", self.inner.queue.name);

            return;
        }

        lifecycle.last_run += 1;

        let id = lifecycle.last_run;
        let running = CancellationToken::new();
        let handles = Arc::new(tokio::sync::Mutex::new(Handles::default()));

        let poll_loop = PollLoop {
            inner: Arc::clone(&self.inner),
            run: id,
            running: running.clone(),
            handles: Arc::clone(&handles),
        };
        let task = tokio::spawn(poll_loop.run());

        lifecycle.state = ConsumerState::Running;
        lifecycle.current = Some(Run {
            id,
            running,
            task,
            handles,
        });

        info!(
            "Consumer of queue {} started ({:?}, run #{})",
            self.inner.queue.name, self.inner.queue.behavior, id
        );
    }

    /// Signal the poll loop to stop and release the broker handles.
    ///
    /// The loop gets one poll interval to finish, after that it is aborted. Calling it on a
    /// consumer which isn't running does nothing.
    pub async fn stop(&self) {
        let run = {
            let mut lifecycle = self.inner.lifecycle();

            match lifecycle.state {
                ConsumerState::Running => lifecycle.current.take(),
                _ => None,
            }
        };

        let Some(Run {
            id,
            running,
            mut task,
            handles,
        }) = run
        else {
            debug!("Consumer of queue {} is not running", self.inner.queue.name);

            return;
        };

        running.cancel();

        let grace = self.inner.queue.poll_interval_duration();

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(
                "Poll loop of queue {} didn't finish in {:?}, aborting it",
                self.inner.queue.name, grace
            );

            task.abort();
        }

        handles.lock().await.release().await;
        self.inner.finish(id);
    }

    /// Stop the consumer and make sure no broker handle is left open. It can be called any
    /// number of times.
    pub async fn close(&self) {
        self.stop().await;

        let handles = {
            let lifecycle = self.inner.lifecycle();

            match (lifecycle.state, &lifecycle.current) {
                (ConsumerState::Running, _) | (_, None) => None,
                (_, Some(run)) => Some(Arc::clone(&run.handles)),
            }
        };

        if let Some(handles) = handles {
            handles.lock().await.release().await;
        }
    }
}

impl<E> Drop for Consumer<E> {
    fn drop(&mut self) {
        // The loop task releases the handles itself once it sees the cancellation.
        if let Some(run) = self.inner.lifecycle().current.take() {
            run.running.cancel();
        }
    }
}

impl<E> Inner<E> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the run as stopped unless a newer run has been started since.
    fn finish(&self, run: u64) {
        let mut lifecycle = self.lifecycle();

        if lifecycle.last_run == run && lifecycle.state == ConsumerState::Running {
            lifecycle.state = ConsumerState::Stopped;

            info!("Consumer of queue {} stopped (run #{})", self.queue.name, run);
        }
    }
}

/// The body of one run, living on its own task.
struct PollLoop<E> {
    inner: Arc<Inner<E>>,
    run: u64,
    running: CancellationToken,
    handles: Arc<tokio::sync::Mutex<Handles>>,
}

impl<E: Send + 'static> PollLoop<E> {
    async fn run(self) {
        let queue = &self.inner.queue;

        match self.subscribe().await {
            Ok(()) => match queue.behavior {
                ConsumerBehavior::SingleRead => self.read_once().await,
                ConsumerBehavior::Persistent => self.read_until_stopped().await,
            },
            Err(e) => error!("Cannot subscribe to queue {}: {}", queue.name, e),
        }

        self.running.cancel();

        self.handles.lock().await.release().await;
        self.inner.finish(self.run);
    }

    /// Open the connection, the session and the subscription. Whatever got opened stays in
    /// `handles` even if a later step fails.
    async fn subscribe(&self) -> Result<(), ConnectionError> {
        let mut guard = self.handles.lock().await;
        let handles = &mut *guard;

        let connection = handles.connection.insert(self.inner.provider.connect().await?);
        connection.start().await?;

        let session = handles.session.insert(connection.create_session().await?);
        let queue = session.create_queue(&self.inner.queue.name).await?;

        handles.subscription = Some(session.create_subscription(&queue).await?);

        debug!("Subscribed to queue {}", queue.name);

        Ok(())
    }

    async fn read_once(&self) {
        let queue = &self.inner.queue;

        match self.receive().await {
            Ok(Some(message)) => {
                if let Err(e) = self.dispatch(message).await {
                    error!("Error processing message of queue {}: {}", queue.name, e);
                }
            }
            Ok(None) => debug!(
                "No message on queue {} within {:?}",
                queue.name,
                queue.poll_interval_duration()
            ),
            Err(e) => error!("Error receiving from queue {}: {}", queue.name, e),
        }
    }

    async fn read_until_stopped(&self) {
        let queue = &self.inner.queue;

        while !self.running.is_cancelled() {
            match self.receive().await {
                Ok(Some(message)) => {
                    if let Err(e) = self.dispatch(message).await {
                        error!("Skipping message of queue {}: {}", queue.name, e);
                    }
                }
                Ok(None) => (),
                Err(e) => {
                    error!("Error receiving from queue {}, stopping: {}", queue.name, e);

                    break;
                }
            }
        }
    }

    /// Wait one poll interval for a message. A stop request cuts the wait short.
    async fn receive(&self) -> Result<Option<Message>, ConnectionError> {
        let mut handles = self.handles.lock().await;
        let subscription = handles
            .subscription
            .as_mut()
            .ok_or(ConnectionError::Closed("subscription"))?;

        tokio::select! {
            received = subscription.receive(self.inner.queue.poll_interval_duration()) => received,
            _ = self.running.cancelled() => Ok(None),
        }
    }

    async fn dispatch(&self, message: Message) -> Result<(), SerializationError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Bytes(bytes) => {
                trace!(
                    "Ignoring binary message of {} bytes on queue {}",
                    bytes.len(),
                    self.inner.queue.name
                );

                return Ok(());
            }
        };

        trace!("Message from queue {}: {}", self.inner.queue.name, text);

        let entity = self.inner.codec.decode(&text)?;

        self.process(entity).await;

        Ok(())
    }

    /// Run the processor under the configured time limit. Its errors and panics end up in the
    /// log only.
    async fn process(&self, entity: E) {
        let queue = &self.inner.queue;
        let call = AssertUnwindSafe(self.inner.processor.process(entity)).catch_unwind();

        let outcome = match queue.process_timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(
                        "Processing a message of queue {} took more than {:?}, abandoned",
                        queue.name, limit
                    );

                    return;
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(())) => (),
            Ok(Err(e)) => error!("Processing a message of queue {} failed: {:#}", queue.name, e),
            Err(_) => error!("Processor of queue {} panicked", queue.name),
        }
    }
}

/// Type erased view of a [`Consumer`], for owners managing consumers of different entities.
#[async_trait]
pub trait ManagedConsumer: Send + Sync {
    fn queue_name(&self) -> &str;

    fn behavior(&self) -> ConsumerBehavior;

    fn state(&self) -> ConsumerState;

    fn start(&self);

    async fn stop(&self);

    async fn close(&self);
}

#[async_trait]
impl<E: Send + 'static> ManagedConsumer for Consumer<E> {
    fn queue_name(&self) -> &str {
        Consumer::queue_name(self)
    }

    fn behavior(&self) -> ConsumerBehavior {
        Consumer::behavior(self)
    }

    fn state(&self) -> ConsumerState {
        Consumer::state(self)
    }

    fn start(&self) {
        Consumer::start(self)
    }

    async fn stop(&self) {
        Consumer::stop(self).await
    }

    async fn close(&self) {
        Consumer::close(self).await
    }
}
