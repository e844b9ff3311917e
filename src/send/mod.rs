pub mod bundler;
pub mod meta_submessage;
pub mod send_pipeline;
pub mod send_queue;
