pub mod checkpoint;
pub mod mtr;
pub mod redo;
pub mod storage;
