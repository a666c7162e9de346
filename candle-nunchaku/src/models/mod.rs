pub mod flux;
