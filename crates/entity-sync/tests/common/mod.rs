//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fmt::Write as FmtWrite;
use std::sync::{Arc, Mutex};

use entity_sync::{
    MemoryStore, Orchestrator, Record, RecordType, ReferenceKind, ScalarType, Schema,
};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Library schema: books, users, rentals referencing both, plus a flat
/// `Item` type and a composite-keyed `Stock` type.
pub fn library_schema() -> Arc<Schema> {
    Arc::new(
        Schema::new(vec![
            RecordType::new("Book")
                .with_table("books")
                .with_field("id", ScalarType::I32)
                .with_field("title", ScalarType::Text)
                .with_primary_key(&["id"])
                .with_reference("rentals", "Rental", ReferenceKind::Many, &["book_id"]),
            RecordType::new("User")
                .with_table("users")
                .with_field("id", ScalarType::I32)
                .with_field("login", ScalarType::Text)
                .with_primary_key(&["id"]),
            RecordType::new("Rental")
                .with_table("rentals")
                .with_field("id", ScalarType::I32)
                .with_field("book_id", ScalarType::I32)
                .with_nullable_field("user_id", ScalarType::I32)
                .with_concurrency_token("version", ScalarType::I64)
                .with_primary_key(&["id"])
                .with_reference("book", "Book", ReferenceKind::One, &["book_id"])
                .with_reference("user", "User", ReferenceKind::One, &["user_id"]),
            RecordType::new("Item")
                .with_table("items")
                .with_field("id", ScalarType::I32)
                .with_field("name", ScalarType::Text)
                .with_primary_key(&["id"]),
            RecordType::new("Stock")
                .with_table("stock")
                .with_field("sku", ScalarType::Text)
                .with_field("region", ScalarType::Text)
                .with_field("quantity", ScalarType::I64)
                .with_primary_key(&["sku", "region"]),
            RecordType::new("Category")
                .with_table("categories")
                .with_field("id", ScalarType::I32)
                .with_field("name", ScalarType::Text)
                .with_nullable_field("parent_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("parent", "Category", ReferenceKind::One, &["parent_id"]),
        ])
        .expect("library schema is valid"),
    )
}

/// Fresh source and destination stores with every table of `schema`.
pub fn stores(schema: &Schema) -> (MemoryStore, MemoryStore) {
    (MemoryStore::from_schema(schema), MemoryStore::from_schema(schema))
}

pub fn orchestrator(schema: &Arc<Schema>, src: &MemoryStore, dst: &MemoryStore) -> Orchestrator {
    Orchestrator::new(schema.clone(), Box::new(src.clone()), Box::new(dst.clone()))
}

pub fn item(id: i32, name: &str) -> Record {
    Record::new().with("id", id).with("name", name)
}

pub fn book(id: i32, title: &str) -> Record {
    Record::new().with("id", id).with("title", title)
}

pub fn user(id: i32, login: &str) -> Record {
    Record::new().with("id", id).with("login", login)
}

pub fn rental(id: i32, book_id: i32, user_id: i32) -> Record {
    Record::new()
        .with("id", id)
        .with("book_id", book_id)
        .with("user_id", user_id)
        .with("version", 1i64)
}

pub async fn seed(store: &MemoryStore, table: &str, rows: Vec<Record>) {
    for row in rows {
        store.insert_row(table, row).await.expect("seed row");
    }
}

/// Captured log line.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
}

/// Tracing layer collecting events for assertions.
#[derive(Clone, Default)]
pub struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureLayer {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.events()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Ok(mut events) = self.events.lock() {
            events.push(CapturedEvent {
                level: *event.metadata().level(),
                message: visitor.message,
            });
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}

/// Install a capture layer as the thread default for the guard's lifetime.
pub fn capture_logs() -> (CaptureLayer, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::layer::SubscriberExt;

    let layer = CaptureLayer::default();
    let subscriber = tracing_subscriber::registry().with(layer.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (layer, guard)
}
