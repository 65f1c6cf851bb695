pub mod imposters;
pub mod system;
