pub mod attributes;
pub mod codec;
pub mod descriptor;
pub mod layout;
pub mod model;
pub mod optimise;
