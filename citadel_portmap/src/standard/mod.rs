//! The IGD protocol stack, from SSDP datagrams up to the [`upnp_handler::UPnPHandler`] facade.
pub mod device_description;
pub mod discovery;
pub mod soap;
pub mod socket_helpers;
pub mod ssdp;
pub mod upnp_handler;
pub mod wan_client;
