pub mod client;
pub mod commands;
pub mod features;
pub mod homie;
pub mod output;
pub mod sensor;
