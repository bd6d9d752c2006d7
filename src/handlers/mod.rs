pub mod auth;
pub mod cards;
pub mod lnurlp;
pub mod lnurlw;
pub mod reply;
