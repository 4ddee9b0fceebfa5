pub use anvil_core::*;

pub mod hammerers {
    pub use anvil_core::hammerer::*;
    #[cfg(feature = "dummy")]
    pub use anvil_dummy::{Dummy, Never};
    #[cfg(feature = "flush")]
    pub use anvil_flush::{FlushError, FlushHammerer};
}
