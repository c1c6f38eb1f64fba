//! Composes the four subsystems into a single owned value so application
//! code has one thing to start and one thing to shut down, rather than
//! reaching for process-wide singletons.

use crate::config::Config;
use crate::db::DbDaemon;
use crate::fiber::FiberScheduler;
use crate::timer::TimerDriver;
use crate::worker::WorkerPool;

/// Owns one instance each of the fiber scheduler, timer driver, worker
/// pool and DB daemon. Timers, workers and the DB daemon are independent
/// of the scheduler and of each other; fiber bodies are the only thing
/// that depends on all three.
pub struct Runtime {
    pub scheduler: FiberScheduler,
    pub timers: TimerDriver,
    pub workers: WorkerPool,
    pub db: DbDaemon,
}

impl Runtime {
    /// Builds every subsystem from `config`. Thread counts come from
    /// `fiber.thread_count`, `worker.thread_count` and
    /// `mysql_max_thread_count`; everything else is read by the
    /// respective subsystem's own constructor.
    pub fn start(config: &Config) -> crate::error::Result<Self> {
        let fiber_threads = config.get_clamped_usize("fiber.thread_count", 256, 1);
        let worker_threads = config.get_clamped_usize("worker.thread_count", 256, 1);

        let timers = TimerDriver::new();
        let workers = WorkerPool::new(worker_threads)?;
        let db = DbDaemon::new(config);
        let scheduler = FiberScheduler::new(fiber_threads);

        Ok(Self {
            scheduler,
            timers,
            workers,
            db,
        })
    }

    /// Drains and joins every subsystem, in the reverse of construction
    /// order, matching the cooperative-shutdown contract described for
    /// each daemon individually: flip `running`, drain queues, join.
    pub fn shutdown(self) {
        self.scheduler.shutdown();
        self.db.shutdown();
        self.workers.shutdown();
        self.timers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_shuts_down_cleanly() {
        let cfg = Config::from_pairs([
            ("fiber.thread_count", "2"),
            ("worker.thread_count", "2"),
            ("mysql_max_thread_count", "1"),
        ]);
        let rt = Runtime::start(&cfg).unwrap();
        rt.shutdown();
    }
}
