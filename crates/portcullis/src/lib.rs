//! # portcullis
//!
//! Command line front end for per-container virtual networking.
//!
//! A container host calls `portcullis up` once a container's network
//! namespace exists and `portcullis down` when the container goes away. The
//! shared NAT network every container joins is managed with
//! `create-network` and `delete-network`.

#![warn(missing_docs)]

pub mod cli;
