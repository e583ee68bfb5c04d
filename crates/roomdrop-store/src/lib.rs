pub mod accountant;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod locks;
pub mod policy;
pub mod reaper;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::MetaDb;
pub use engine::{Download, RoomEngine};
pub use error::{PolicyViolation, StoreError};
pub use policy::Limits;
pub use reaper::{Reaper, run_reaper_loop};
pub use storage::BlobStore;
