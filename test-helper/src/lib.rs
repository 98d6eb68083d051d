mod addr;

pub use addr::{bind_unused_listener, get_unused_addr};

/// Installs a formatting subscriber for the test, ignoring any already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
