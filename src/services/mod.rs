pub mod ascii;
pub mod fanout;
pub mod forecast;
pub mod intents;
pub mod kml;
pub mod poi;
pub mod stations;
pub mod transport;
