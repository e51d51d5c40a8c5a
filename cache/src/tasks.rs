//! Background maintenance tasks.
//!
//! Tasks are plain value objects carrying a cache handle (obtained from
//! the manager's registry at request time) plus a weak manager
//! reference, so a task never keeps a torn-down manager alive. They are
//! posted to the host's executor as boxed closures; a refused post is
//! rolled back by the requesting path.

use crate::cache::Cache;
use crate::manager::Manager;
use crate::table::Table;

use std::sync::{Arc, Weak};

/// Evict entries until usage drops below the lowered soft limit, then
/// commit the shrink.
///
/// Precondition: the cache's resizing flag is set. The flag stays set
/// while work remains (the task re-enqueues itself) and is cleared on
/// completion or abandonment.
pub(crate) struct FreeMemoryTask {
    pub cache: Arc<Cache>,
    pub manager: Weak<Manager>,
}

impl FreeMemoryTask {
    const MAX_INLINE_PASSES: usize = 8;

    pub fn run(self) {
        let core = self.cache.core();
        debug_assert!(core.is_resizing_flag_set());

        for _ in 0..Self::MAX_INLINE_PASSES {
            if core.is_shutdown() {
                core.with_metadata(|meta| meta.abandon_resize());
                return;
            }
            let target = core.soft_usage_limit();
            if core.usage() <= target {
                let released = core.with_metadata(|meta| meta.commit_resize());
                tracing::debug!(
                    cache = core.id(),
                    released,
                    "shrink committed"
                );
                if let Some(manager) = self.manager.upgrade() {
                    manager.resize_committed(released);
                }
                // cleared last, so a waiter observing the clear also
                // observes the settled accounting
                core.with_metadata(|meta| meta.end_resizing());
                return;
            }
            let _ = core.free_memory_while(|_| core.usage() > target);

            // hand any remainder back to the executor
            if core.usage() > target
                && let Some(manager) = self.manager.upgrade()
            {
                let requeue = FreeMemoryTask {
                    cache: self.cache.clone(),
                    manager: self.manager.clone(),
                };
                if manager.post_task(Box::new(move || requeue.run())) {
                    return;
                }
            }
        }

        tracing::warn!(
            cache = core.id(),
            "free-memory task could not reach its target; abandoning shrink"
        );
        core.with_metadata(|meta| meta.abandon_resize());
    }
}

/// Rebuild the cache onto `new_table` and hand the drained table back to
/// the manager.
///
/// Precondition: the cache's migrating flag is set; it is cleared by the
/// migration itself.
pub(crate) struct MigrateTask {
    pub cache: Arc<Cache>,
    pub manager: Weak<Manager>,
    pub new_table: Arc<Table>,
}

impl MigrateTask {
    pub fn run(self) {
        let core = self.cache.core();
        match core.migrate(self.new_table.clone()) {
            Some(old_table) => {
                tracing::debug!(
                    cache = core.id(),
                    log_size = self.new_table.log_size(),
                    "migration complete"
                );
                if let Some(manager) = self.manager.upgrade() {
                    manager.migrate_completed(old_table);
                }
            }
            None => {
                // the cache was torn down first; return the unused table
                if let Some(manager) = self.manager.upgrade() {
                    manager.migration_aborted(self.new_table);
                }
            }
        }
        // cleared last, so a waiter observing the clear also observes
        // the settled accounting
        core.with_metadata(|meta| meta.end_migrating());
    }
}

/// Apply a rebalance decision: lower a cache's usage limit and drain it.
pub(crate) struct ResizeTask {
    pub cache: Arc<Cache>,
    pub manager: Weak<Manager>,
    pub new_limit: u64,
}

impl ResizeTask {
    pub fn run(self) {
        let core = self.cache.core();
        if !core.with_metadata(|meta| meta.begin_resize_to(self.new_limit)) {
            return;
        }
        tracing::debug!(
            cache = core.id(),
            new_limit = self.new_limit,
            "rebalance shrink started"
        );
        FreeMemoryTask {
            cache: self.cache,
            manager: self.manager,
        }
        .run();
    }
}
