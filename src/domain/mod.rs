// Domain layer: message model and stage capability ports.

pub mod model;
pub mod ports;
