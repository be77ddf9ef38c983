pub mod builds;
pub mod certs;
pub mod deployments;
pub mod domains;
pub mod environments;
pub mod images;
pub mod instances;
pub mod leases;
pub mod logs;
pub mod models;
pub mod nodes;
pub mod projects;
pub mod regions;
