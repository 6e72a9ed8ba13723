pub mod redo_log;
pub mod undo_log;
