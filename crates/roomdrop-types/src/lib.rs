pub mod api;
pub mod models;

pub use models::{FileRecord, InvalidRoomId, MessageRecord, RoomId, RoomView};
