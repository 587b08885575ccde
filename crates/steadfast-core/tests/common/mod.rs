#![allow(dead_code)]

pub mod script_server;
