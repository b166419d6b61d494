#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod util;
pub mod log;
pub mod settings;
pub mod pool;
pub mod value;
pub mod range_cache;
pub mod variables;
pub mod model;
pub mod procfs;
pub mod target;
pub mod eval;
pub mod format;
pub mod context;
