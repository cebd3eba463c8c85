//! Sample aggregation and result hand-off.

pub mod result_channel;
pub mod window;

pub use result_channel::{
    result_channel, ErrorStatus, Reading, ResultPublisher, ResultReceiver, Sample, Update,
};
pub use window::SlidingWindowAverager;
