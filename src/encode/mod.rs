pub mod geojson;
pub mod stream;
