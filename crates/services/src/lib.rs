pub mod log_tail;
