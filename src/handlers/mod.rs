mod admitted;
mod health;
mod server_info;

pub use admitted::admitted;
pub use health::health_check;
pub use server_info::server_info;
