pub mod analysis;
pub mod lir;
