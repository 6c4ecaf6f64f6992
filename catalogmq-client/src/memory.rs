//! In-process broker.
//!
//! All queues are owned by one broker task, the handles talk to it through a command channel
//! and get their answers on oneshot channels. Receivers which find their queue empty park a
//! oneshot sender in the queue, the next published message goes to the first waiter still
//! listening. A receiver which stops listening after its waiter got a message puts the message
//! back to the head of the queue.

use crate::broker::{Connection, ConnectionProvider, Publisher, Queue, Session, Subscription};
use crate::error::ConnectionError;
use crate::message::Message;
use async_trait::async_trait;
use log::{debug, error, trace};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Broker operations where a failure can be injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Connect,
    CreateSession,
    CreateQueue,
    CreatePublisher,
    CreateSubscription,
    Publish,
    Receive,
    Close,
}

impl FailurePoint {
    fn operation(self) -> &'static str {
        match self {
            FailurePoint::Connect => "connect",
            FailurePoint::CreateSession => "create session",
            FailurePoint::CreateQueue => "create queue",
            FailurePoint::CreatePublisher => "create publisher",
            FailurePoint::CreateSubscription => "create subscription",
            FailurePoint::Publish => "publish",
            FailurePoint::Receive => "receive",
            FailurePoint::Close => "close",
        }
    }
}

#[derive(Debug)]
enum BrokerCommand {
    Publish {
        queue: String,
        message: Message,
        result: oneshot::Sender<()>,
    },
    Receive {
        queue: String,
        waiter: oneshot::Sender<Message>,
    },
    Requeue {
        queue: String,
        message: Message,
    },
    Depth {
        queue: String,
        result: oneshot::Sender<usize>,
    },
}

type BrokerSink = mpsc::Sender<BrokerCommand>;

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<Message>,
    waiters: VecDeque<oneshot::Sender<Message>>,
}

impl MemoryQueue {
    fn push(&mut self, mut message: Message) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(message) {
                Ok(()) => return,
                // The receiver gave up waiting, try the next one.
                Err(returned) => message = returned,
            }
        }

        self.messages.push_back(message);
    }

    /// Give back a message which was handed over but never taken.
    fn requeue(&mut self, message: Message) {
        if self.messages.is_empty() {
            self.push(message);
        } else {
            self.messages.push_front(message);
        }
    }

    fn pop_or_wait(&mut self, waiter: oneshot::Sender<Message>) {
        self.waiters.retain(|w| !w.is_closed());

        match self.messages.pop_front() {
            Some(message) => {
                if let Err(returned) = waiter.send(message) {
                    self.messages.push_front(returned);
                }
            }
            None => self.waiters.push_back(waiter),
        }
    }
}

async fn command_loop(mut commands: mpsc::Receiver<BrokerCommand>) {
    let mut queues: HashMap<String, MemoryQueue> = HashMap::new();

    while let Some(command) = commands.recv().await {
        trace!("Broker command {:?}", command);

        match command {
            BrokerCommand::Publish { queue, message, result } => {
                queues.entry(queue).or_default().push(message);

                if result.send(()).is_err() {
                    error!("Publisher went away before the publish was confirmed");
                }
            }
            BrokerCommand::Receive { queue, waiter } => {
                queues.entry(queue).or_default().pop_or_wait(waiter);
            }
            BrokerCommand::Requeue { queue, message } => {
                debug!("Message given back to queue {}", queue);

                queues.entry(queue).or_default().requeue(message);
            }
            BrokerCommand::Depth { queue, result } => {
                let depth = queues.get(&queue).map_or(0, |q| q.messages.len());

                let _ = result.send(depth);
            }
        }
    }

    debug!("Memory broker stopped");
}

/// Waiter of a receive in flight. Dropped with a message in it, it sends the message back.
struct PendingReceive {
    queue: String,
    rx: oneshot::Receiver<Message>,
    sink: BrokerSink,
}

impl Drop for PendingReceive {
    fn drop(&mut self) {
        self.rx.close();

        let Ok(message) = self.rx.try_recv() else {
            return;
        };

        let command = BrokerCommand::Requeue {
            queue: std::mem::take(&mut self.queue),
            message,
        };

        match self.sink.try_send(command) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(command)) => {
                let sink = self.sink.clone();

                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if sink.send(command).await.is_err() {
                                error!("Broker is gone, message cannot be given back");
                            }
                        });
                    }
                    Err(_) => error!("No runtime to give back a message"),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => error!("Broker is gone, message cannot be given back"),
        }
    }
}

/// Counts a living handle until it is dropped.
#[derive(Debug)]
struct OpenHandle(Arc<AtomicUsize>);

impl OpenHandle {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);

        OpenHandle(Arc::clone(counter))
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct HandleCounters {
    connections: Arc<AtomicUsize>,
    sessions: Arc<AtomicUsize>,
    publishers: Arc<AtomicUsize>,
    subscriptions: Arc<AtomicUsize>,
}

struct BrokerShared {
    credentials: Option<(String, String)>,
    counters: HandleCounters,
    failures: Mutex<HashSet<FailurePoint>>,
}

/// In-process broker which implements [`ConnectionProvider`].
///
/// Cloning gives another reference to the same broker. Besides serving producers and consumers
/// it can tell how many handles are open and it can be told to fail specific operations.
#[derive(Clone)]
pub struct MemoryBroker {
    sink: BrokerSink,
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    /// Start a broker which accepts any credentials. It needs a running tokio runtime.
    pub fn start() -> Self {
        Self::spawn(None)
    }

    /// Start a broker which accepts only the given user.
    pub fn start_with_credentials(username: &str, password: &str) -> Self {
        Self::spawn(Some((username.to_owned(), password.to_owned())))
    }

    /// Provider which logs in with the given credentials.
    pub fn connector(&self, username: &str, password: &str) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    fn spawn(credentials: Option<(String, String)>) -> Self {
        let (sink, stream) = mpsc::channel(16);

        tokio::spawn(command_loop(stream));

        MemoryBroker {
            sink,
            shared: Arc::new(BrokerShared {
                credentials,
                counters: HandleCounters::default(),
                failures: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Make every subsequent `point` operation fail until [`MemoryBroker::clear_failures`].
    pub fn fail_on(&self, point: FailurePoint) {
        self.failures().insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures().clear();
    }

    /// Number of connections, sessions, publishers and subscriptions not closed yet.
    pub fn open_handles(&self) -> usize {
        let c = &self.shared.counters;

        [&c.connections, &c.sessions, &c.publishers, &c.subscriptions]
            .iter()
            .map(|counter| counter.load(Ordering::SeqCst))
            .sum()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.counters.connections.load(Ordering::SeqCst)
    }

    /// Number of messages waiting in the queue.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let (tx, rx) = oneshot::channel();
        let command = BrokerCommand::Depth {
            queue: queue.to_owned(),
            result: tx,
        };

        if self.sink.send(command).await.is_err() {
            return 0;
        }

        rx.await.unwrap_or_default()
    }

    /// Put a message on a queue without opening any handle.
    pub async fn publish(&self, queue: &str, message: Message) -> Result<(), ConnectionError> {
        self.check(FailurePoint::Publish)?;

        let (tx, rx) = oneshot::channel();
        let command = BrokerCommand::Publish {
            queue: queue.to_owned(),
            message,
            result: tx,
        };

        self.sink
            .send(command)
            .await
            .map_err(|_| ConnectionError::Closed("broker"))?;

        rx.await.map_err(|_| ConnectionError::Closed("broker"))
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Message>, ConnectionError> {
        self.check(FailurePoint::Receive)?;

        let (tx, rx) = oneshot::channel();
        let command = BrokerCommand::Receive {
            queue: queue.to_owned(),
            waiter: tx,
        };

        self.sink
            .send(command)
            .await
            .map_err(|_| ConnectionError::Closed("broker"))?;

        // From here on the receive may be dropped at any await, the guard gives back what the
        // broker handed over in the meantime.
        let mut pending = PendingReceive {
            queue: queue.to_owned(),
            rx,
            sink: self.sink.clone(),
        };

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            message = &mut pending.rx => {
                message.map(Some).map_err(|_| ConnectionError::Closed("broker"))
            }
            _ = &mut sleep => {
                // The broker may have handed over a message right at the deadline.
                pending.rx.close();

                Ok(pending.rx.try_recv().ok())
            }
        }
    }

    fn check(&self, point: FailurePoint) -> Result<(), ConnectionError> {
        if !self.failures().contains(&point) {
            return Ok(());
        }

        match point {
            FailurePoint::Connect => Err(ConnectionError::Unreachable {
                url: "memory://".to_owned(),
                reason: "injected failure".to_owned(),
            }),
            _ => Err(ConnectionError::broker(point.operation(), "injected failure")),
        }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashSet<FailurePoint>> {
        self.shared.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_connection(&self, username: &str, password: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        self.check(FailurePoint::Connect)?;

        if let Some((user, pass)) = &self.shared.credentials {
            if user != username || pass != password {
                return Err(ConnectionError::AccessRefused {
                    username: username.to_owned(),
                });
            }
        }

        debug!("Memory broker connection opened by {:?}", username);

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            handle: Some(OpenHandle::new(&self.shared.counters.connections)),
        }))
    }
}

/// Connecting to the broker without credentials. Only brokers started with
/// [`MemoryBroker::start`] let such connections in.
#[async_trait]
impl ConnectionProvider for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        self.open_connection("", "")
    }
}

/// Connection provider logging in to a [`MemoryBroker`] with a username and password.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    username: String,
    password: String,
}

#[async_trait]
impl ConnectionProvider for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        self.broker.open_connection(&self.username, &self.password)
    }
}

/// Gives back the handle counter and fails if a close failure is injected. The handle counts as
/// released either way.
fn close_handle(broker: &MemoryBroker, handle: &mut Option<OpenHandle>, name: &'static str) -> Result<(), ConnectionError> {
    if handle.take().is_none() {
        return Err(ConnectionError::Closed(name));
    }

    broker.check(FailurePoint::Close)
}

fn ensure_open(handle: &Option<OpenHandle>, name: &'static str) -> Result<(), ConnectionError> {
    match handle {
        Some(_) => Ok(()),
        None => Err(ConnectionError::Closed(name)),
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    handle: Option<OpenHandle>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_session(&mut self) -> Result<Box<dyn Session>, ConnectionError> {
        ensure_open(&self.handle, "connection")?;
        self.broker.check(FailurePoint::CreateSession)?;

        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            handle: Some(OpenHandle::new(&self.broker.shared.counters.sessions)),
        }))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        close_handle(&self.broker, &mut self.handle, "connection")
    }
}

struct MemorySession {
    broker: MemoryBroker,
    handle: Option<OpenHandle>,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_queue(&mut self, name: &str) -> Result<Queue, ConnectionError> {
        ensure_open(&self.handle, "session")?;
        self.broker.check(FailurePoint::CreateQueue)?;

        Ok(Queue { name: name.to_owned() })
    }

    async fn create_publisher(&mut self, queue: &Queue) -> Result<Box<dyn Publisher>, ConnectionError> {
        ensure_open(&self.handle, "session")?;
        self.broker.check(FailurePoint::CreatePublisher)?;

        Ok(Box::new(MemoryPublisher {
            broker: self.broker.clone(),
            queue: queue.name.clone(),
            handle: Some(OpenHandle::new(&self.broker.shared.counters.publishers)),
        }))
    }

    async fn create_subscription(&mut self, queue: &Queue) -> Result<Box<dyn Subscription>, ConnectionError> {
        ensure_open(&self.handle, "session")?;
        self.broker.check(FailurePoint::CreateSubscription)?;

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            queue: queue.name.clone(),
            handle: Some(OpenHandle::new(&self.broker.shared.counters.subscriptions)),
        }))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        close_handle(&self.broker, &mut self.handle, "session")
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
    queue: String,
    handle: Option<OpenHandle>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        ensure_open(&self.handle, "publisher")?;

        self.broker.publish(&self.queue, message).await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        close_handle(&self.broker, &mut self.handle, "publisher")
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    queue: String,
    handle: Option<OpenHandle>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ConnectionError> {
        ensure_open(&self.handle, "subscription")?;

        self.broker.receive(&self.queue, timeout).await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        close_handle(&self.broker, &mut self.handle, "subscription")
    }
}
