pub mod org;

pub use org::OrgContext;
