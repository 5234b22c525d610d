pub mod hex_address;
