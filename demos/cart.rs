//! Walks one shopping cart through its lifecycle using the file-backed
//! journal and snapshot store, then restarts the store and reads the cart
//! back from disk.
//!
//! Run with: `cargo run --example cart`
//!
//! Set `RUST_LOG=shopping_cart_es=debug` to see the entity runtime's logs.

use shopping_cart_es::{
    CartCommand, CommandContext, DEFAULT_SHARDS, EntityStore, EventJournal, FileJournal,
    FileSnapshotStore, ShardTagger, ShoppingCart,
};
use tracing_subscriber::EnvFilter;

type CartStore = EntityStore<ShoppingCart, FileJournal, FileSnapshotStore>;

fn open_store(dir: &std::path::Path) -> CartStore {
    EntityStore::new(FileJournal::new(dir), FileSnapshotStore::new(dir))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tmp = tempfile::tempdir()?;
    let store = open_store(tmp.path());
    let ctx = CommandContext::default()
        .with_actor("demo")
        .with_correlation_id("demo-run-1");
    let cart_id = "cart-42";

    let steps = [
        CartCommand::add_item("A", 2)?,
        CartCommand::add_item("A", 1)?,
        CartCommand::adjust_item_quantity("A", 5)?,
        CartCommand::remove_item("B")?,
        CartCommand::Checkout,
        CartCommand::add_item("C", 1)?,
        CartCommand::Get,
    ];
    for cmd in steps {
        let label = format!("{cmd:?}");
        let reply = store.ask(cart_id, cmd, ctx.clone()).await?;
        println!("{label:<60} -> {reply:?}");
    }

    // Three events were persisted; the no-op remove and rejections left none.
    let tagger = ShardTagger::for_aggregate::<ShoppingCart>(DEFAULT_SHARDS);
    let tag = tagger.label(tagger.shard_for(cart_id));
    let records = store.journal().events_by_tag(&tag).await?;
    println!("{tag}: {} event(s)", records.len());
    for record in &records {
        println!("  #{} {}", record.sequence_nr, record.event_type);
    }
    assert_eq!(records.len(), 3);

    // Stop everything and recover from disk with a fresh store.
    store.passivate_all().await;
    drop(store);

    let store = open_store(tmp.path());
    let cart = store.entity(cart_id).await?.state().await?;
    println!("recovered: {:?}", cart.summary());
    assert!(cart.is_checked_out());

    Ok(())
}
