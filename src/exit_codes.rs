// Exit codes of the streamrec binary

pub const SUCCESS: i32 = 0;
pub const NO_SOURCES_FOUND: i32 = 1;
pub const IO_ERROR: i32 = 2;
pub const STOP_TIMED_OUT: i32 = 3;
