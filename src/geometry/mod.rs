pub mod bbox;
pub mod color;
pub mod element;

pub use bbox::{Bbox, bounding_box};
pub use element::Element;
