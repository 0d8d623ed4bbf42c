//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atomic_readmodel::infra::{InMemoryDocumentStore, InMemoryEventLog};
use atomic_readmodel::{
    CollectionWrapper, HandlerError, LiveProcessor, ProjectionConfig, ReadModel, Signature,
};

/// Events of the sample order aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEvent {
    Placed { customer_id: String },
    ItemAdded { sku: String, quantity: u32 },
    Shipped,
    /// Payment captured on the linked payment stream
    PaymentCaptured { amount_cents: u64 },
    /// Fails every handler; simulates a bug in projection code
    Corrupt,
    Audited,
}

impl OrderEvent {
    pub fn placed(customer_id: &str) -> Self {
        OrderEvent::Placed {
            customer_id: customer_id.to_string(),
        }
    }

    pub fn item(sku: &str, quantity: u32) -> Self {
        OrderEvent::ItemAdded {
            sku: sku.to_string(),
            quantity,
        }
    }
}

/// Order summary read model; `SIG` is the schema signature so tests can
/// deploy "new code" by switching type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary<const SIG: Signature> {
    pub order_id: String,
    pub customer_id: Option<String>,
    pub item_count: u32,
    pub shipped: bool,
    #[serde(default)]
    pub paid_cents: u64,
}

impl<const SIG: Signature> ReadModel for OrderSummary<SIG> {
    type Event = OrderEvent;

    const NAME: &'static str = "order_summary";
    const SIGNATURE: Signature = SIG;

    fn create(id: &str) -> Self {
        Self {
            order_id: id.to_string(),
            customer_id: None,
            item_count: 0,
            shipped: false,
            paid_cents: 0,
        }
    }

    fn apply(&mut self, event: &OrderEvent) -> Result<bool, HandlerError> {
        match event {
            OrderEvent::Placed { customer_id } => {
                self.customer_id = Some(customer_id.clone());
                Ok(true)
            }
            OrderEvent::ItemAdded { quantity, .. } => {
                self.item_count += quantity;
                Ok(true)
            }
            OrderEvent::Shipped => {
                self.shipped = true;
                Ok(true)
            }
            OrderEvent::Corrupt => Err(HandlerError::new("corrupt event payload")),
            OrderEvent::PaymentCaptured { .. } | OrderEvent::Audited => Ok(false),
        }
    }

    fn apply_extra_stream(
        &mut self,
        _aggregate_id: &str,
        event: &OrderEvent,
    ) -> Result<bool, HandlerError> {
        match event {
            OrderEvent::PaymentCaptured { amount_cents } => {
                self.paid_cents += amount_cents;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub type OrderSummaryV1 = OrderSummary<1>;
pub type OrderSummaryV2 = OrderSummary<2>;

/// Collection name under the default configuration
pub const ORDER_COLLECTION: &str = "rm_order_summary";

/// Generate a random aggregate ID
pub fn random_id(prefix: &str) -> String {
    format!("{}-{}", prefix, &Uuid::new_v4().to_string()[..8])
}

/// In-memory log, store and processor wired together
pub struct Harness {
    pub log: Arc<InMemoryEventLog<OrderEvent>>,
    pub store: Arc<InMemoryDocumentStore>,
    pub live: Arc<LiveProcessor<OrderEvent>>,
    pub config: ProjectionConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ProjectionConfig::default().with_replay_page_size(4))
    }

    pub fn with_config(config: ProjectionConfig) -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        let live = Arc::new(LiveProcessor::<OrderEvent>::from_config(
            log.clone(),
            &config,
        ));
        Self {
            log,
            store: Arc::new(InMemoryDocumentStore::new()),
            live,
            config,
        }
    }

    pub fn collection<M: ReadModel<Event = OrderEvent>>(&self) -> CollectionWrapper<M> {
        CollectionWrapper::new(self.store.clone(), self.live.clone(), &self.config)
    }

    /// Append one changeset per event
    pub async fn append_each(&self, id: &str, events: Vec<OrderEvent>) {
        for event in events {
            self.log.append(id, vec![event]).await;
        }
    }
}
