pub mod guid;
pub mod header;
pub mod number_set;
pub mod sequence_number;
pub mod submessage;
