#![deny(unreachable_pub)]

pub mod actions;
pub mod aggregate;
pub mod cache;
pub mod cluster;
pub mod env;
pub mod error;
pub mod model;
pub mod osimage;
pub mod query;
pub mod queue;
pub mod rapi;
pub mod refdata;
pub mod tags;
pub mod vnc;
