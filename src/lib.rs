//! A small HTTP/1.0 server: static files, CGI scripts, per-directory access rules and Basic
//! authentication, configured through `httpd.conf` files.

pub mod access;
pub mod cgi;
pub mod config;
pub mod crypt;
pub mod encode;
pub mod mime;
pub mod request;
pub mod response;
pub mod server;
