pub mod reassembly;
pub mod receive_buffers;
pub mod receive_strategy;
pub mod received_sample;
pub mod rtps_receiver;
