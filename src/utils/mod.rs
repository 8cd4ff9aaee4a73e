pub mod clock;
pub mod format;
pub mod retry;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use format::format_file_size;
pub use retry::{RetryBuilder, RetryStrategy};
