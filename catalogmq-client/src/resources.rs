use crate::broker::{Connection, Publisher, Session, Subscription};
use crate::error::{ConnectionError, ResourceTeardownError};
use log::{error, trace};

/// Broker handles acquired by a producer call or a consumer run.
///
/// Acquisition can stop half way, so every handle is optional and released on its own.
#[derive(Default)]
pub(crate) struct Handles {
    pub(crate) connection: Option<Box<dyn Connection>>,
    pub(crate) session: Option<Box<dyn Session>>,
    pub(crate) publisher: Option<Box<dyn Publisher>>,
    pub(crate) subscription: Option<Box<dyn Subscription>>,
}

impl Handles {
    pub(crate) fn is_empty(&self) -> bool {
        self.connection.is_none() && self.session.is_none() && self.publisher.is_none() && self.subscription.is_none()
    }

    /// Close the handles innermost first. A failing close is logged and the rest still closed.
    pub(crate) async fn release(&mut self) {
        if self.is_empty() {
            return;
        }

        if let Some(mut subscription) = self.subscription.take() {
            log_teardown("subscription", subscription.close().await);
        }

        if let Some(mut publisher) = self.publisher.take() {
            log_teardown("publisher", publisher.close().await);
        }

        if let Some(mut session) = self.session.take() {
            log_teardown("session", session.close().await);
        }

        if let Some(mut connection) = self.connection.take() {
            log_teardown("connection", connection.close().await);
        }

        trace!("Broker handles released");
    }
}

fn log_teardown(resource: &'static str, result: Result<(), ConnectionError>) {
    if let Err(cause) = result {
        error!("{}", ResourceTeardownError { resource, cause });
    }
}
