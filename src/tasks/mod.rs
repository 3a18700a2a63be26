pub mod flusher;
