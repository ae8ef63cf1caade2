pub mod analyzer;
pub mod indicators;
pub mod patterns;
pub mod signals;
pub mod structure;


pub use analyzer::*;
pub use indicators::*;
pub use patterns::*;
pub use signals::*;
pub use structure::*;
