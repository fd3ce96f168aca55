pub mod api;
pub mod handler;
pub mod models;
pub mod room;
pub mod server;

/// Connection ID.
pub type ConnId = usize;

/// Short human-enterable code identifying a live room.
pub type RoomCode = String;

/// Message sent to a connection.
pub type Msg = String;
