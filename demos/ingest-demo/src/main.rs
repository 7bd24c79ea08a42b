//! Producer demo: ingests a small build-telemetry DAG (fetch -> parse ->
//! publish, one chain per CI run) and prints the resulting work-unit states.
//!
//! Run with `RUN_IDS=a,b,c cargo run -p ingest-demo`.

use std::env;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use workflow_engine::{NewWorkUnit, Payload, Store};
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

    let run_ids: Vec<String> = env::var("RUN_IDS")
        .unwrap_or_else(|_| "run-1,run-2,run-3".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    for run_id in &run_ids {
        let publish = store.create(new_unit(&PublishResults { run_id: run_id.clone() })).await?;
        let parse = store.create(new_unit(&ParseCiLog { run_id: run_id.clone() })).await?;
        let fetch = store.create(new_unit(&FetchCiLog { run_id: run_id.clone() })).await?;

        store.add_requirement(parse.id, fetch.id).await?;
        store.add_requirement(publish.id, parse.id).await?;

        println!("ingested run {run_id}: fetch={} parse={} publish={}", fetch.id, parse.id, publish.id);
    }

    for run_id in &run_ids {
        let ready = store.get_by_state("fetch_ci_log", workflow_engine::WorkUnitState::Ready).await?;
        let this_run: Vec<_> = ready.iter().filter(|u| u.description.contains(run_id.as_str())).collect();
        for unit in this_run {
            println!("ready to dispatch: {} ({})", unit.description, unit.payload_type);
        }
    }

    Ok(())
}
