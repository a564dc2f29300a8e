//! Point-in-time stats snapshot.
//!
//! Built as a generic JSON tree so observers (an admin endpoint, the logs)
//! can render it without coupling to controller internals. Produced on the
//! controller's own loop, so everything it reads is consistent.

use serde_json::{json, Map, Value};
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::controller::Controller;

impl Controller {
    pub(crate) fn stats_snapshot(&self) -> Value {
        let mut st = Map::new();
        st.insert(
            "Servers".to_string(),
            self.srvmgr
                .as_ref()
                .map(|s| s.stats())
                .unwrap_or(Value::Null),
        );
        st.insert("Bitcoin Daemon".to_string(), self.bitcoind.stats());

        let mut m = Map::new();
        m.insert("Headers".to_string(), json!(self.storage.header_count()));

        let sm_value = match &self.sm {
            Some(sm) => {
                let mut m2 = Map::new();
                m2.insert("State".to_string(), json!(sm.state.as_str()));
                m2.insert("Height".to_string(), json!(sm.target_height));

                let n_dl = self.n_headers_downloaded_so_far();
                if n_dl > 0 {
                    m2.insert("Headers_Downloaded_This_Run".to_string(), json!(n_dl));
                }
                let (n_tx, n_ins, n_outs) = self.n_tx_in_out_so_far();
                if n_tx > 0 {
                    m2.insert(
                        "Txs_Seen_This_Run".to_string(),
                        json!({ "nTx": n_tx, "nIns": n_ins, "nOut": n_outs }),
                    );
                }

                let backlog = sm.pp_blocks.len();
                m2.insert("BackLog_Blocks".to_string(), json!(backlog));
                if backlog > 0 {
                    let (raw, mem, txs) = sm.backlog_bytes();
                    m2.insert(
                        "BackLog_RawBlocksDataSize".to_string(),
                        json!(format!("{:.3} MiB", raw as f64 / 1e6)),
                    );
                    m2.insert(
                        "BackLog_InMemoryDataSize".to_string(),
                        json!(format!("{:.3} MiB", mem as f64 / 1e6)),
                    );
                    m2.insert("BackLog_Txs".to_string(), json!(txs));
                }
                Value::Object(m2)
            }
            None => Value::Null,
        };
        m.insert("StateMachine".to_string(), sm_value);

        let timers: Map<String, Value> = self
            .timers
            .iter()
            .map(|(name, t)| ((*name).to_string(), json!(t.interval.as_millis() as u64)))
            .collect();
        m.insert("activeTimers".to_string(), Value::Object(timers));

        let now = Instant::now();
        let tasks: Vec<Value> = self
            .tasks
            .values()
            .map(|t| {
                let progress = t.dl.as_ref().map(|c| c.last_progress()).unwrap_or(0.0);
                let mut entry = Map::new();
                entry.insert(
                    t.name.clone(),
                    json!({
                        "age": format!("{:.3} sec", now.duration_since(t.started_at).as_secs_f64()),
                        "progress": format!("{:.1}%", progress * 100.0),
                    }),
                );
                Value::Object(entry)
            })
            .collect();
        m.insert("tasks".to_string(), json!(tasks));

        st.insert("Controller".to_string(), Value::Object(m));
        Value::Object(st)
    }

    /// Rough count of headers delivered by the live download tasks.
    fn n_headers_downloaded_so_far(&self) -> u64 {
        self.tasks
            .values()
            .filter_map(|t| t.dl.as_ref())
            .map(|c| c.n_so_far())
            .sum()
    }

    /// Transaction/input/output totals across the live download tasks.
    fn n_tx_in_out_so_far(&self) -> (u64, u64, u64) {
        let mut totals = (0u64, 0u64, 0u64);
        for core in self.tasks.values().filter_map(|t| t.dl.as_ref()) {
            totals.0 += core.n_tx.load(Ordering::Relaxed);
            totals.1 += core.n_ins.load(Ordering::Relaxed);
            totals.2 += core.n_outs.load(Ordering::Relaxed);
        }
        totals
    }
}
