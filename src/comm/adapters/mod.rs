pub mod struct_file;
pub mod transport;
