// Cojoin Engine — FAB widgets, anti-automation gate and site service.
//
// Client side: a headless document, the fragment loader, the gate, timers,
// drag positioning and the lifecycle controller that ties them together.
// Server side: the site server answering the same contracts the client
// talks to.

pub mod chat;
pub mod config;
pub mod crypto;
pub mod dom;
pub mod drag;
pub mod form;
pub mod fragment;
pub mod gate;
pub mod http;
pub mod lifecycle;
pub mod server;
pub mod storage;
pub mod timer;
pub mod worker;
