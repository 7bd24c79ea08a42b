//! Worker demo: seeds the same fetch -> parse -> publish chain as
//! `ingest-demo`, registers a handler per payload type, and lets the
//! dispatcher drain it to completion against an in-memory store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use workflow_engine::{
    CommandRegistry, DispatcherBuilder, DispatcherConfig, Handler, NewWorkUnit, Outcome, Payload, Store,
};
use workflow_engine_testing::InMemoryStore;

#[derive(Debug, Serialize, Deserialize)]
struct FetchCiLog {
    run_id: String,
}

impl Payload for FetchCiLog {
    const PAYLOAD_TYPE: &'static str = "fetch_ci_log";
    fn description(&self) -> String {
        format!("fetch CI log for run {}", self.run_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ParseCiLog {
    run_id: String,
}

impl Payload for ParseCiLog {
    const PAYLOAD_TYPE: &'static str = "parse_ci_log";
    fn description(&self) -> String {
        format!("parse CI log for run {}", self.run_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PublishResults {
    run_id: String,
}

impl Payload for PublishResults {
    const PAYLOAD_TYPE: &'static str = "publish_results";
    fn description(&self) -> String {
        format!("publish results for run {}", self.run_id)
    }
}

struct PrintlnHandler {
    verb: &'static str,
}

#[async_trait]
impl Handler<FetchCiLog> for PrintlnHandler {
    async fn handle(&self, payload: &FetchCiLog) -> anyhow::Result<Outcome> {
        println!("[{}] {}", self.verb, payload.run_id);
        Ok(Outcome::Succeeded)
    }
}

#[async_trait]
impl Handler<ParseCiLog> for PrintlnHandler {
    async fn handle(&self, payload: &ParseCiLog) -> anyhow::Result<Outcome> {
        println!("[{}] {}", self.verb, payload.run_id);
        Ok(Outcome::Succeeded)
    }
}

#[async_trait]
impl Handler<PublishResults> for PrintlnHandler {
    async fn handle(&self, payload: &PublishResults) -> anyhow::Result<Outcome> {
        println!("[{}] {}", self.verb, payload.run_id);
        Ok(Outcome::Succeeded)
    }
}

fn new_unit<P: Payload>(payload: &P) -> NewWorkUnit {
    NewWorkUnit {
        payload_type: P::PAYLOAD_TYPE.to_string(),
        payload: serde_json::to_value(payload).expect("payload must serialize"),
        description: payload.description(),
        search_terms: payload.search_terms(),
        creator_id: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    for run_id in ["run-1", "run-2", "run-3"] {
        let publish = store.create(new_unit(&PublishResults { run_id: run_id.to_string() })).await?;
        let parse = store.create(new_unit(&ParseCiLog { run_id: run_id.to_string() })).await?;
        let fetch = store.create(new_unit(&FetchCiLog { run_id: run_id.to_string() })).await?;
        store.add_requirement(parse.id, fetch.id).await?;
        store.add_requirement(publish.id, parse.id).await?;
    }

    let registry = CommandRegistry::new()
        .register::<FetchCiLog, _>(PrintlnHandler { verb: "fetching" })
        .register::<ParseCiLog, _>(PrintlnHandler { verb: "parsing" })
        .register::<PublishResults, _>(PrintlnHandler { verb: "publishing" });

    let config = DispatcherConfig {
        poll_interval: StdDuration::from_millis(50),
        applier_interval: StdDuration::from_millis(50),
        ..DispatcherConfig::default()
    };
    let dispatcher = DispatcherBuilder::new(store.clone(), registry)
        .with_config(config)
        .build();

    let handle = dispatcher.start();
    tokio::time::sleep(StdDuration::from_millis(750)).await;
    handle.shutdown();
    handle.join().await;

    let counts = store.counts_by_type_and_state().await?;
    let mut rows: Vec<_> = counts.into_iter().collect();
    rows.sort_by(|a, b| a.0 .0.cmp(&b.0 .0).then(a.0 .1.code().cmp(b.0 .1.code())));
    for ((payload_type, state), count) in rows {
        println!("{payload_type:>16} {state} {count}");
    }

    Ok(())
}
