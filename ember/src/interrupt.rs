//! IRQ handler registry.
//!
//! The interrupt descriptor table and the low-level entry stubs live with
//! the boot code; after saving the interrupted context the entry calls
//! [`dispatch`] with the hardware IRQ line.

use alloc::sync::Arc;
use uni_lock::UniLock;

const LINES: usize = 16;

const VACANT: UniLock<Option<Arc<dyn Fn() + Send + Sync>>> = UniLock::new(None);
static HANDLERS: [UniLock<Option<Arc<dyn Fn() + Send + Sync>>>; LINES] = [VACANT; LINES];

/// Bind `handler` to a hardware IRQ line.
pub fn register(line: usize, handler: impl Fn() + Send + Sync + 'static) {
    *HANDLERS.get(line).expect("Invalid irq line").lock() = Some(Arc::new(handler));
}

/// Run the handler bound to `line`, if any.
pub fn dispatch(line: usize) {
    let handler = HANDLERS.get(line).and_then(|slot| slot.lock().clone());
    if let Some(handler) = handler {
        handler()
    } else {
        warning!("unhandled irq #{}", line);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn registered_handler_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        super::register(15, move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        super::dispatch(15);
        super::dispatch(15);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn vacant_line_is_ignored() {
        super::dispatch(14);
    }
}
