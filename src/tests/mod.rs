use crate::logging::{self, TracingLogger};

mod interception;

/// The logger factory is process-wide, registering it again is harmless
fn init() {
    logging::register_factory(TracingLogger::factory);
}
