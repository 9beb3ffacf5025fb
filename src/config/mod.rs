//! Connection configuration.
//!
//! Menger stores are addressed by a URI of the form
//! `<scheme>://[auth@][host]/<path-or-database>`. Today `sqlite` is the only
//! implemented scheme (file path or `:memory:`); `postgresql` parses but has
//! no backend yet (see `Backend` trait docs).

mod uri;

pub use uri::{Scheme, Uri};
