pub mod checkpoint;
pub mod data;
pub mod model;
pub mod training;
pub mod utils;
