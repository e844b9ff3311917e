pub mod backoff;
pub mod counts;
pub mod outbound_sample;
pub mod reliable_reader;
pub mod reliable_writer;
pub mod send_buffer;
