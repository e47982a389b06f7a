#![allow(dead_code)]

pub mod chain;
pub mod lightning;
pub mod node;
pub mod wait;
