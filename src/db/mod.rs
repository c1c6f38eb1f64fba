//! The sharded MySQL writer daemon: `DbDaemon` owns a [`router::Router`]
//! which in turn owns one [`shard::ShardHandle`] per configured shard.
//!
//! Configuration keys (see `crate::config`): `mysql_max_thread_count`,
//! `mysql_server_addr`/`_port`, `mysql_slave_addr`/`_port`,
//! `mysql_username`/`_password`/`_schema`, `mysql_use_ssl`, `mysql_dump_dir`,
//! `mysql_save_delay`, `mysql_reconn_delay`, `mysql_max_retry_count`,
//! `mysql_retry_init_delay`.

pub mod connection;
pub mod operation;
pub mod router;
pub mod shard;

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;

use crate::config::Config;
use crate::promise::Future as PromiseFuture;

pub use connection::ConnectionSpec;
pub use operation::{CombineStamp, DbFuture, DbObject, OperationKind, SequenceCounter};
pub use router::Router;
pub use shard::ShardConfig;

/// `YYYY-MM-DD` in local time, used to name failure-dump files.
pub(crate) fn dump_date_string() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Owns the sharded writer pool and the table→shard router. Constructed
/// once at startup from [`Config`]; `submit_*` methods are the daemon's
/// public surface for enqueuing operations from fiber bodies or elsewhere.
pub struct DbDaemon {
    router: Router,
    sequence: SequenceCounter,
    save_delay: Duration,
}

impl DbDaemon {
    pub fn new(config: &Config) -> Self {
        let spec = Arc::new(ConnectionSpec::from_config(config));
        let shard_config = Arc::new(ShardConfig {
            reconn_delay: config.get_duration_ms("mysql_reconn_delay", 5000),
            max_retry_count: config.get_i64("mysql_max_retry_count", 3) as u32,
            retry_init_delay: config.get_duration_ms("mysql_retry_init_delay", 1000),
            dump_dir: {
                let dir = config.get_str("mysql_dump_dir", "");
                if dir.is_empty() {
                    None
                } else {
                    Some(std::path::PathBuf::from(dir))
                }
            },
            dump_mutex: std::sync::Mutex::new(()),
        });
        let shard_count = config.get_clamped_usize("mysql_max_thread_count", 256, 1);
        let save_delay = config.get_duration_ms("mysql_save_delay", 5000);
        Self {
            router: Router::new(shard_count, spec, shard_config),
            sequence: SequenceCounter::default(),
            save_delay,
        }
    }

    /// Enqueues a write-combined `Save` for `object`. `stamp` is the
    /// object's own [`CombineStamp`]; callers keep one per persisted
    /// entity and pass it to every `submit_save` for that entity.
    pub fn submit_save(&self, object: Arc<dyn DbObject>, stamp: Arc<CombineStamp>) -> DbFuture<()> {
        let seq = self.sequence.next();
        stamp.mark_pending(seq);
        let table = object.table();
        self.router.submit(
            table,
            OperationKind::Save { object, stamp, seq },
            false,
            false,
            self.save_delay,
        )
    }

    pub fn submit_delete(&self, table: &'static str, sql: impl Into<String>) -> DbFuture<()> {
        self.router
            .submit(table, OperationKind::Delete { sql: sql.into() }, false, false, Duration::ZERO)
    }

    pub fn submit_load(
        &self,
        table: &'static str,
        sql: impl Into<String>,
        on_row: impl FnOnce(mysql::Row) -> crate::error::Result<()> + Send + 'static,
    ) -> DbFuture<()> {
        self.router.submit(
            table,
            OperationKind::Load {
                sql: sql.into(),
                on_row: Some(Box::new(on_row)),
            },
            true,
            false,
            Duration::ZERO,
        )
    }

    pub fn submit_batch_load(
        &self,
        table: &'static str,
        sql: impl Into<String>,
        on_row: impl FnMut(mysql::Row) -> crate::error::Result<()> + Send + 'static,
    ) -> DbFuture<()> {
        self.router.submit(
            table,
            OperationKind::BatchLoad {
                sql: sql.into(),
                on_row: Some(Box::new(on_row)),
            },
            true,
            false,
            Duration::ZERO,
        )
    }

    /// Runs `body` with direct access to the raw connection; `use_slave`
    /// picks which connection slot is handed to it. `set_success` is
    /// suppressed for this variant per §4.5.4: the body communicates its
    /// own outcome by whatever side channel it likes.
    pub fn submit_low_level_access(
        &self,
        table: &'static str,
        use_slave: bool,
        body: impl FnOnce(&mut mysql::Conn) + Send + 'static,
    ) -> DbFuture<()> {
        self.router.submit(
            table,
            OperationKind::LowLevelAccess { body: Some(Box::new(body)) },
            use_slave,
            false,
            Duration::ZERO,
        )
    }

    /// Broadcasts a `Wait` to every shard; the returned future resolves
    /// once all shards have processed it (see `operation::WaitShared`).
    pub fn submit_wait(&self) -> PromiseFuture<()> {
        self.router.submit_wait()
    }

    /// Blocks the calling thread until every shard's queue has drained.
    pub fn wait_till_idle(&self) {
        self.router.wait_till_idle();
    }

    pub fn shutdown(self) {
        self.router.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_date_string_has_expected_shape() {
        let s = dump_date_string();
        assert_eq!(s.len(), 10);
        assert_eq!(s.chars().nth(4), Some('-'));
    }

    #[test]
    fn daemon_builds_shards_from_config() {
        let cfg = Config::from_pairs([("mysql_max_thread_count", "2")]);
        let daemon = DbDaemon::new(&cfg);
        daemon.shutdown();
    }
}
