pub mod cursor;
pub mod fragment;
pub mod node;
pub mod node_cache;
pub mod tree;
