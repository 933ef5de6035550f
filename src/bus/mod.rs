//! # Bus
//!
//! Topic-keyed fan-out with bounded per-subscription queues, an interceptor
//! pipeline, and periodic telemetry (spec §4.2).
//!
//! Grounded on `framework/core.rs`'s `ResourceActor`/`ResourceClient` split:
//! a single task owns the routing table and processes commands serially
//! (no lock is ever held across an `.await`), while a cheap, cloneable
//! handle (`BusHandle`) talks to it over an `mpsc` channel exactly like
//! `ResourceClient<T>` talks to a `ResourceActor<T>`. The generalization
//! from the teacher is the fan-out itself: where `ResourceActor` owns one
//! `HashMap<T::Id, T>`, `Bus` owns one `Vec<Arc<Subscription>>` per topic
//! and spawns one consumer task per subscription (rather than per entity).

pub mod interceptor;
pub mod status;
pub mod subscription;

pub use interceptor::{InterceptOutcome, Interceptor, InterceptorHandle};
pub use subscription::{
    EnqueueOutcome, Filter, OverflowPolicy, Subscription, SubscriptionHandle, DEFAULT_CAPACITY,
    DEFAULT_PUBLISH_DEADLINE, MAX_CAPACITY,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::contracts::{Envelope, Payload, PublishMetadata, SequenceGenerator, Topic};
use crate::error::BusError;
use subscription::BoundedQueue;

/// Default per-handler invocation deadline (spec §5).
pub const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(5);

/// Callback invoked serially for every message delivered to a subscription.
///
/// Async-trait object, mirroring the teacher's `ActorEntity` lifecycle
/// hooks: one method, a default-free contract, and an explicit error type
/// instead of a thrown exception (Design Notes §9, "Exceptions as control
/// flow").
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Blanket impl so a plain `async fn(Arc<Envelope>) -> Result<...>` closure
/// captured in an `Arc` can be used directly without a wrapper struct.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send,
{
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (self)(envelope).await
    }
}

enum Command {
    Publish {
        topic: Topic,
        payload: Payload,
        metadata: PublishMetadata,
        respond_to: oneshot::Sender<Result<u64, BusError>>,
    },
    Subscribe {
        topic: Topic,
        subscriber_id: String,
        handler: Arc<dyn Handler>,
        capacity: usize,
        policy: OverflowPolicy,
        filter: Option<Filter>,
        respond_to: oneshot::Sender<Result<SubscriptionHandle, BusError>>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        respond_to: oneshot::Sender<Result<(), BusError>>,
    },
    Intercept {
        interceptor: Arc<dyn Interceptor>,
        respond_to: oneshot::Sender<InterceptorHandle>,
    },
    RemoveInterceptor {
        handle: InterceptorHandle,
    },
}

/// A cheap, cloneable client for the bus. Holds only a sender, the same
/// shape as the teacher's `ResourceClient<T>`.
#[derive(Clone)]
pub struct BusHandle {
    sender: mpsc::Sender<Command>,
    publish_deadline: Duration,
    handler_deadline: Duration,
}

impl BusHandle {
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: Payload,
        metadata: PublishMetadata,
    ) -> Result<u64, BusError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(Command::Publish {
                topic: topic.clone(),
                payload,
                metadata,
                respond_to,
            })
            .await
            .map_err(|_| BusError::UnknownSubscription)?;
        response.await.map_err(|_| BusError::UnknownSubscription)?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        topic: &Topic,
        subscriber_id: impl Into<String>,
        handler: Arc<dyn Handler>,
        capacity: usize,
        policy: OverflowPolicy,
        filter: Option<Filter>,
    ) -> Result<SubscriptionHandle, BusError> {
        Subscription::validate_capacity(capacity)?;
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(Command::Subscribe {
                topic: topic.clone(),
                subscriber_id: subscriber_id.into(),
                handler,
                capacity,
                policy,
                filter,
                respond_to,
            })
            .await
            .map_err(|_| BusError::UnknownSubscription)?;
        response.await.map_err(|_| BusError::UnknownSubscription)?
    }

    pub async fn subscribe_default(
        &self,
        topic: &Topic,
        subscriber_id: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.subscribe(
            topic,
            subscriber_id,
            handler,
            DEFAULT_CAPACITY,
            OverflowPolicy::DropNewest,
            None,
        )
        .await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(Command::Unsubscribe { handle, respond_to })
            .await
            .map_err(|_| BusError::UnknownSubscription)?;
        response.await.map_err(|_| BusError::UnknownSubscription)?
    }

    pub async fn intercept(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorHandle {
        let (respond_to, response) = oneshot::channel();
        let _ = self
            .sender
            .send(Command::Intercept {
                interceptor,
                respond_to,
            })
            .await;
        response.await.unwrap_or(InterceptorHandle(0))
    }

    pub async fn remove_interceptor(&self, handle: InterceptorHandle) {
        let _ = self.sender.send(Command::RemoveInterceptor { handle }).await;
    }

    pub fn publish_deadline(&self) -> Duration {
        self.publish_deadline
    }

    pub fn handler_deadline(&self) -> Duration {
        self.handler_deadline
    }
}

/// The bus server. Owns the routing table; never shared outside this module
/// except through `BusHandle` and the telemetry sampler's read-only registry.
pub struct Bus {
    receiver: mpsc::Receiver<Command>,
    subscriptions_by_topic: HashMap<String, Vec<Arc<Subscription>>>,
    registry: Arc<Mutex<Vec<Arc<Subscription>>>>,
    consumer_tasks: HashMap<SubscriptionHandle, tokio::task::JoinHandle<()>>,
    interceptors: Vec<(InterceptorHandle, Arc<dyn Interceptor>)>,
    sequence: Arc<SequenceGenerator>,
    published_total: Arc<AtomicU64>,
    next_subscription_handle: u64,
    next_interceptor_handle: u64,
    publish_deadline: Duration,
    handler_deadline: Duration,
}

impl Bus {
    /// Builds the bus and its handle, and spawns the router task and the
    /// `status.bus` telemetry sampler. Mirrors `ResourceActor::new` +
    /// `tokio::spawn(actor.run(..))` in the teacher's `OrderSystem::new`.
    pub fn spawn() -> BusHandle {
        Self::spawn_with(DEFAULT_PUBLISH_DEADLINE, DEFAULT_HANDLER_DEADLINE, status::DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn spawn_with(
        publish_deadline: Duration,
        handler_deadline: Duration,
        sample_interval: Duration,
    ) -> BusHandle {
        let (sender, receiver) = mpsc::channel(1024);
        let registry = Arc::new(Mutex::new(Vec::new()));
        let published_total = Arc::new(AtomicU64::new(0));
        let handle = BusHandle {
            sender,
            publish_deadline,
            handler_deadline,
        };
        let bus = Bus {
            receiver,
            subscriptions_by_topic: HashMap::new(),
            registry: registry.clone(),
            consumer_tasks: HashMap::new(),
            interceptors: Vec::new(),
            sequence: SequenceGenerator::new(),
            published_total: published_total.clone(),
            next_subscription_handle: 1,
            next_interceptor_handle: 1,
            publish_deadline,
            handler_deadline,
        };
        tokio::spawn(bus.run());
        status::spawn_sampler(handle.clone(), registry, published_total, sample_interval);
        handle
    }

    async fn run(mut self) {
        info!("bus started");
        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                Command::Publish {
                    topic,
                    payload,
                    metadata,
                    respond_to,
                } => {
                    let result = self.handle_publish(topic, payload, metadata).await;
                    let _ = respond_to.send(result);
                }
                Command::Subscribe {
                    topic,
                    subscriber_id,
                    handler,
                    capacity,
                    policy,
                    filter,
                    respond_to,
                } => {
                    let result =
                        self.handle_subscribe(topic, subscriber_id, handler, capacity, policy, filter);
                    let _ = respond_to.send(result);
                }
                Command::Unsubscribe { handle, respond_to } => {
                    let result = self.handle_unsubscribe(handle);
                    let _ = respond_to.send(result);
                }
                Command::Intercept {
                    interceptor,
                    respond_to,
                } => {
                    let handle = InterceptorHandle(self.next_interceptor_handle);
                    self.next_interceptor_handle += 1;
                    debug!(name = interceptor.name(), "interceptor installed");
                    self.interceptors.push((handle, interceptor));
                    let _ = respond_to.send(handle);
                }
                Command::RemoveInterceptor { handle } => {
                    self.interceptors.retain(|(h, _)| *h != handle);
                }
            }
        }
        info!("bus shut down");
    }

    async fn handle_publish(
        &mut self,
        topic: Topic,
        payload: Payload,
        metadata: PublishMetadata,
    ) -> Result<u64, BusError> {
        let sequence = self.sequence.next();
        let mut envelope = Envelope::new(sequence, &topic, payload, metadata);

        for (_, interceptor) in &self.interceptors {
            match interceptor.intercept(&mut envelope).await {
                InterceptOutcome::Continue => {}
                InterceptOutcome::Drop => {
                    debug!(topic = %topic, "message dropped by interceptor");
                    return Ok(sequence);
                }
            }
        }

        self.published_total.fetch_add(1, Ordering::Relaxed);

        let targets = match self.subscriptions_by_topic.get(topic.as_str()) {
            Some(v) => v.clone(),
            None => return Ok(sequence),
        };

        let envelope = Arc::new(envelope);
        let deadline = self.publish_deadline;
        let mut fanout = tokio::task::JoinSet::new();
        for sub in targets {
            if let Some(filter) = &sub.filter {
                if !filter(&envelope) {
                    continue;
                }
            }
            let envelope = envelope.clone();
            fanout.spawn(async move {
                let outcome = sub.queue.enqueue(envelope, sub.overflow_policy, deadline).await;
                match outcome {
                    EnqueueOutcome::Enqueued => {}
                    EnqueueOutcome::DroppedNewest | EnqueueOutcome::DroppedOldest => {
                        sub.record_dropped(1);
                    }
                    EnqueueOutcome::TimedOut => {
                        warn!(subscriber = %sub.subscriber_id, "publish timed out (PublishTimeout)");
                        sub.record_dropped(1);
                    }
                    EnqueueOutcome::Cancelled => {
                        warn!(subscriber = %sub.subscriber_id, "publish cancelled (queue closed)");
                    }
                }
            });
        }
        while fanout.join_next().await.is_some() {}

        Ok(sequence)
    }

    fn handle_subscribe(
        &mut self,
        topic: Topic,
        subscriber_id: String,
        handler: Arc<dyn Handler>,
        capacity: usize,
        policy: OverflowPolicy,
        filter: Option<Filter>,
    ) -> Result<SubscriptionHandle, BusError> {
        Subscription::validate_capacity(capacity)?;
        let handle = SubscriptionHandle(self.next_subscription_handle);
        self.next_subscription_handle += 1;

        let queue = BoundedQueue::new(capacity);
        let subscription = Arc::new(Subscription {
            handle,
            subscriber_id: subscriber_id.clone(),
            topic: topic.as_str().to_string(),
            queue: queue.clone(),
            capacity,
            overflow_policy: policy,
            filter,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consecutive_failures: std::sync::atomic::AtomicUsize::new(0),
            degraded: std::sync::atomic::AtomicBool::new(false),
        });

        self.subscriptions_by_topic
            .entry(topic.as_str().to_string())
            .or_default()
            .push(subscription.clone());
        self.registry.lock().push(subscription.clone());

        let handler_deadline = self.handler_deadline;
        let sub_for_task = subscription.clone();
        let task = tokio::spawn(async move {
            run_consumer(sub_for_task, handler, handler_deadline).await;
        });
        self.consumer_tasks.insert(handle, task);

        info!(subscriber = %subscriber_id, topic = %topic, capacity, "subscribed");
        Ok(handle)
    }

    fn handle_unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let mut found = false;
        for subs in self.subscriptions_by_topic.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.handle == handle) {
                let sub = subs.remove(pos);
                let discarded = sub.queue.drain_discard();
                sub.record_dropped(discarded as u64);
                sub.queue.close();
                found = true;
                break;
            }
        }
        self.registry.lock().retain(|s| s.handle != handle);
        if let Some(task) = self.consumer_tasks.remove(&handle) {
            task.abort();
        }
        if found {
            Ok(())
        } else {
            Err(BusError::UnknownSubscription)
        }
    }
}

/// One consumer task per subscription (spec §4.2: "the bus owns one logical
/// consumer per subscription queue that invokes the handler serially").
async fn run_consumer(subscription: Arc<Subscription>, handler: Arc<dyn Handler>, deadline: Duration) {
    while let Some(envelope) = subscription.queue.pop().await {
        match tokio::time::timeout(deadline, handler.handle(envelope)).await {
            Ok(Ok(())) => subscription.record_delivered(),
            Ok(Err(e)) => {
                warn!(subscriber = %subscription.subscriber_id, error = %e, "handler error");
                if subscription.record_failure() {
                    warn!(subscriber = %subscription.subscriber_id, "subscription marked degraded");
                }
            }
            Err(_) => {
                warn!(subscriber = %subscription.subscriber_id, "handler invocation timed out (HandlerTimeout)");
                if subscription.record_failure() {
                    warn!(subscriber = %subscription.subscriber_id, "subscription marked degraded");
                }
            }
        }
    }
}
