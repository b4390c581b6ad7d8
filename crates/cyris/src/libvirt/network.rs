//! Range-local network XML generation
//!
//! Each declared network becomes one isolated libvirt network whose bridge
//! carries the range id, so concurrent ranges never share a segment. The
//! gateway address is the first host of the subnet; guests get static
//! addresses assigned by the topology manager, so DHCP stays off.

use color_eyre::Result;

use crate::xml_utils::XmlDocument;

/// Prefix shared by every range-local bridge.
pub const BRIDGE_PREFIX: &str = "cr-br-";

/// Bridge naming convention: `cr-br-<range_id>-<network_name>`.
pub fn bridge_name(range_id: &str, network_name: &str) -> String {
    format!("{}{}-{}", BRIDGE_PREFIX, range_id, network_name)
}

/// Definition of one range-local network.
#[derive(Debug, Clone)]
pub struct NetworkDefinition {
    /// libvirt network and bridge name
    pub name: String,
    /// Gateway address given to the bridge
    pub gateway: String,
    /// Dotted-quad netmask of the subnet
    pub netmask: String,
}

impl NetworkDefinition {
    /// Assemble a definition following the bridge naming convention.
    pub fn new(range_id: &str, network_name: &str, gateway: &str, netmask: &str) -> Self {
        Self {
            name: bridge_name(range_id, network_name),
            gateway: gateway.to_string(),
            netmask: netmask.to_string(),
        }
    }

    /// Build the libvirt network XML.
    pub fn build_xml(&self) -> Result<String> {
        let mut doc = XmlDocument::root("network", &[])?;
        doc.element("name", &[], &self.name)?;
        doc.element(
            "bridge",
            &[("name", &self.name), ("stp", "on"), ("delay", "0")],
            "",
        )?;
        // Isolated segment: no <forward>, traffic leaves only through the
        // forwarding rules applied by the topology manager.
        doc.element(
            "ip",
            &[("address", &self.gateway), ("netmask", &self.netmask)],
            "",
        )?;
        doc.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_naming() {
        assert_eq!(bridge_name("train01", "office"), "cr-br-train01-office");
        assert_eq!(bridge_name("125", "dmz"), "cr-br-125-dmz");
    }

    #[test]
    fn test_network_xml() {
        let definition =
            NetworkDefinition::new("train01", "office", "192.168.10.1", "255.255.255.0");
        let xml = definition.build_xml().unwrap();
        assert!(xml.contains("<name>cr-br-train01-office</name>"));
        assert!(xml.contains("bridge name=\"cr-br-train01-office\" stp=\"on\" delay=\"0\""));
        assert!(xml.contains("ip address=\"192.168.10.1\" netmask=\"255.255.255.0\""));
        // Isolated: no NAT/route forward element
        assert!(!xml.contains("<forward"));
    }
}
