pub mod dispatch;
pub mod leasing;
