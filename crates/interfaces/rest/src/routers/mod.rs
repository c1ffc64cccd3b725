pub mod queues;
pub mod websocket;
