pub mod snyk;
pub mod work_item;
