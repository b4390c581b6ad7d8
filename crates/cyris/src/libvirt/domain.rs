//! Domain XML generation for cloned guests
//!
//! Builds libvirt domain definitions for range VMs: a qcow2 overlay disk
//! whose backing store is the built base image, one interface per declared
//! network membership, a serial console, optional graphics and the cyris
//! metadata block that ties the domain back to its range.

use color_eyre::{eyre::eyre, Result};
use uuid::Uuid;

use crate::xml_utils::XmlDocument;

/// One NIC of a cloned guest, attached to a range-local libvirt network.
#[derive(Debug, Clone)]
pub struct DomainInterface {
    /// libvirt network name (`cr-br-<range>-<network>`)
    pub network: String,
    /// NIC model (virtio unless overridden)
    pub model: String,
    /// Fixed MAC, when IP assignment wants a predictable one
    pub mac: Option<String>,
}

/// Graphics section configuration.
#[derive(Debug, Clone)]
pub struct DomainGraphics {
    /// Graphics backend (`vnc`, `spice`, `sdl`, `none`)
    pub kind: String,
    /// Fixed display port; autoport when unset
    pub port: Option<u16>,
    /// Listen address
    pub listen: Option<String>,
}

/// Builder for cloned-guest domain XML.
#[derive(Debug, Default)]
pub struct DomainBuilder {
    name: Option<String>,
    uuid: Option<String>,
    memory_mib: Option<u32>,
    vcpus: Option<u32>,
    overlay_disk: Option<String>,
    backing_image: Option<String>,
    seed_iso: Option<String>,
    interfaces: Vec<DomainInterface>,
    graphics: Option<DomainGraphics>,
    cpu_model: Option<String>,
    range_id: Option<String>,
    guest_id: Option<String>,
    source_image: Option<String>,
}

impl DomainBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the domain name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Pin the domain UUID (random otherwise).
    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = Some(uuid.to_string());
        self
    }

    /// Set memory in MiB.
    pub fn with_memory(mut self, memory_mib: u32) -> Self {
        self.memory_mib = Some(memory_mib);
        self
    }

    /// Set the vCPU count.
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = Some(vcpus);
        self
    }

    /// Overlay disk plus the backing image it references.
    pub fn with_overlay_disk(mut self, overlay: &str, backing: &str) -> Self {
        self.overlay_disk = Some(overlay.to_string());
        self.backing_image = Some(backing.to_string());
        self
    }

    /// Attach a cloud-init seed ISO as a CD-ROM.
    pub fn with_seed_iso(mut self, iso: &str) -> Self {
        self.seed_iso = Some(iso.to_string());
        self
    }

    /// Add one network interface; order of calls is preserved.
    pub fn with_interface(mut self, interface: DomainInterface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Configure the graphics device.
    pub fn with_graphics(mut self, graphics: DomainGraphics) -> Self {
        self.graphics = Some(graphics);
        self
    }

    /// Request a specific CPU model instead of host passthrough.
    pub fn with_cpu_model(mut self, model: &str) -> Self {
        self.cpu_model = Some(model.to_string());
        self
    }

    /// Range bookkeeping recorded in the metadata section.
    pub fn with_range_metadata(mut self, range_id: &str, guest_id: &str, image: &str) -> Self {
        self.range_id = Some(range_id.to_string());
        self.guest_id = Some(guest_id.to_string());
        self.source_image = Some(image.to_string());
        self
    }

    /// Build the domain XML.
    pub fn build_xml(self) -> Result<String> {
        let name = self.name.ok_or_else(|| eyre!("Domain name is required"))?;
        let memory = self.memory_mib.unwrap_or(1024).to_string();
        let vcpus = self.vcpus.unwrap_or(1).to_string();
        let uuid = self.uuid.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut doc = XmlDocument::root("domain", &[("type", "kvm")])?;

        doc.element("name", &[], &name)?;
        doc.element("uuid", &[], &uuid)?;
        doc.element("memory", &[("unit", "MiB")], &memory)?;
        doc.element("currentMemory", &[("unit", "MiB")], &memory)?;
        doc.element("vcpu", &[], &vcpus)?;

        doc.section("os", &[], |d| {
            d.element(
                "type",
                &[("arch", std::env::consts::ARCH), ("machine", "q35")],
                "hvm",
            )?;
            d.element("boot", &[("dev", "hd")], "")
        })?;

        doc.section("features", &[], |d| {
            d.element("acpi", &[], "")?;
            d.element("apic", &[], "")
        })?;

        match self.cpu_model {
            Some(ref model) => doc.section(
                "cpu",
                &[("mode", "custom"), ("match", "exact")],
                |d| d.element("model", &[("fallback", "allow")], model),
            )?,
            None => doc.element("cpu", &[("mode", "host-passthrough")], "")?,
        }

        doc.section("clock", &[("offset", "utc")], |_| Ok(()))?;
        doc.element("on_poweroff", &[], "destroy")?;
        doc.element("on_reboot", &[], "restart")?;
        doc.element("on_crash", &[], "destroy")?;

        let overlay_disk = self.overlay_disk;
        let backing_image = self.backing_image;
        let seed_iso = self.seed_iso;
        let interfaces = self.interfaces;
        let graphics = self.graphics;

        doc.section("devices", &[], |d| {
            if let Some(ref overlay) = overlay_disk {
                d.section("disk", &[("type", "file"), ("device", "disk")], |d| {
                    d.element("driver", &[("name", "qemu"), ("type", "qcow2")], "")?;
                    d.element("source", &[("file", overlay)], "")?;
                    if let Some(ref backing) = backing_image {
                        d.section("backingStore", &[("type", "file")], |d| {
                            d.element("format", &[("type", "qcow2")], "")?;
                            d.element("source", &[("file", backing)], "")
                        })?;
                    }
                    d.element("target", &[("dev", "vda"), ("bus", "virtio")], "")
                })?;
            }

            if let Some(ref iso) = seed_iso {
                d.section("disk", &[("type", "file"), ("device", "cdrom")], |d| {
                    d.element("driver", &[("name", "qemu"), ("type", "raw")], "")?;
                    d.element("source", &[("file", iso)], "")?;
                    d.element("target", &[("dev", "sda"), ("bus", "sata")], "")?;
                    d.element("readonly", &[], "")
                })?;
            }

            for interface in &interfaces {
                d.section("interface", &[("type", "network")], |d| {
                    if let Some(ref mac) = interface.mac {
                        d.element("mac", &[("address", mac)], "")?;
                    }
                    d.element("source", &[("network", &interface.network)], "")?;
                    d.element("model", &[("type", &interface.model)], "")
                })?;
            }

            d.section("serial", &[("type", "pty")], |d| {
                d.element("target", &[("port", "0")], "")
            })?;
            d.section("console", &[("type", "pty")], |d| {
                d.element("target", &[("type", "serial"), ("port", "0")], "")
            })?;

            if let Some(ref graphics) = graphics {
                if graphics.kind != "none" {
                    let port_value;
                    let mut attrs: Vec<(&str, &str)> = vec![("type", &graphics.kind)];
                    match graphics.port {
                        Some(port) => {
                            port_value = port.to_string();
                            attrs.push(("port", &port_value));
                        }
                        None => attrs.push(("autoport", "yes")),
                    }
                    if let Some(ref listen) = graphics.listen {
                        attrs.push(("listen", listen));
                    }
                    d.element("graphics", &attrs, "")?;
                    d.section("video", &[], |d| {
                        d.element("model", &[("type", "vga")], "")
                    })?;
                }
            }
            Ok(())
        })?;

        if self.range_id.is_some() || self.guest_id.is_some() {
            let range_id = self.range_id;
            let guest_id = self.guest_id;
            let source_image = self.source_image;
            doc.section("metadata", &[], |d| {
                d.section(
                    "cyris:range",
                    &[("xmlns:cyris", "https://github.com/cyb3rlab/cyris")],
                    |d| {
                        if let Some(ref range_id) = range_id {
                            d.element("cyris:range-id", &[], range_id)?;
                        }
                        if let Some(ref guest_id) = guest_id {
                            d.element("cyris:guest-id", &[], guest_id)?;
                        }
                        if let Some(ref image) = source_image {
                            d.element("cyris:base-image", &[], image)?;
                        }
                        Ok(())
                    },
                )
            })?;
        }

        doc.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_disk_with_backing_store() {
        let xml = DomainBuilder::new()
            .with_name("cyris-desktop-0011aabbccdd")
            .with_memory(2048)
            .with_vcpus(2)
            .with_overlay_disk(
                "/srv/cyber_range/r1/disks/cyris-desktop-0011aabbccdd.qcow2",
                "/srv/cyber_range/images/ubuntu-20.04-0a1b2c3d4e5f.qcow2",
            )
            .build_xml()
            .unwrap();

        assert!(xml.contains("<name>cyris-desktop-0011aabbccdd</name>"));
        assert!(xml.contains("<memory unit=\"MiB\">2048</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("driver name=\"qemu\" type=\"qcow2\""));
        assert!(xml.contains("<backingStore type=\"file\">"));
        assert!(xml.contains(
            "source file=\"/srv/cyber_range/images/ubuntu-20.04-0a1b2c3d4e5f.qcow2\""
        ));
    }

    #[test]
    fn test_interfaces_in_declared_order() {
        let xml = DomainBuilder::new()
            .with_name("test")
            .with_interface(DomainInterface {
                network: "cr-br-r1-office".to_string(),
                model: "virtio".to_string(),
                mac: Some("52:54:00:aa:bb:01".to_string()),
            })
            .with_interface(DomainInterface {
                network: "cr-br-r1-dmz".to_string(),
                model: "e1000".to_string(),
                mac: None,
            })
            .build_xml()
            .unwrap();

        let office = xml.find("cr-br-r1-office").unwrap();
        let dmz = xml.find("cr-br-r1-dmz").unwrap();
        assert!(office < dmz);
        assert!(xml.contains("mac address=\"52:54:00:aa:bb:01\""));
        assert!(xml.contains("model type=\"e1000\""));
    }

    #[test]
    fn test_seed_iso_cdrom() {
        let xml = DomainBuilder::new()
            .with_name("test")
            .with_seed_iso("/srv/cyber_range/r1/cloud-init.iso")
            .build_xml()
            .unwrap();
        assert!(xml.contains("device=\"cdrom\""));
        assert!(xml.contains("source file=\"/srv/cyber_range/r1/cloud-init.iso\""));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn test_graphics_variants() {
        let xml = DomainBuilder::new()
            .with_name("test")
            .with_graphics(DomainGraphics {
                kind: "vnc".to_string(),
                port: Some(5901),
                listen: Some("127.0.0.1".to_string()),
            })
            .build_xml()
            .unwrap();
        assert!(xml.contains("graphics type=\"vnc\" port=\"5901\" listen=\"127.0.0.1\""));

        let xml = DomainBuilder::new()
            .with_name("test")
            .with_graphics(DomainGraphics {
                kind: "none".to_string(),
                port: None,
                listen: None,
            })
            .build_xml()
            .unwrap();
        assert!(!xml.contains("<graphics"));

        let xml = DomainBuilder::new()
            .with_name("test")
            .with_graphics(DomainGraphics {
                kind: "spice".to_string(),
                port: None,
                listen: None,
            })
            .build_xml()
            .unwrap();
        assert!(xml.contains("graphics type=\"spice\" autoport=\"yes\""));
    }

    #[test]
    fn test_metadata_block() {
        let xml = DomainBuilder::new()
            .with_name("test")
            .with_range_metadata("train01", "desktop", "ubuntu-20.04")
            .build_xml()
            .unwrap();
        assert!(xml.contains("<cyris:range-id>train01</cyris:range-id>"));
        assert!(xml.contains("<cyris:guest-id>desktop</cyris:guest-id>"));
        assert!(xml.contains("<cyris:base-image>ubuntu-20.04</cyris:base-image>"));
    }

    #[test]
    fn test_cpu_model_override() {
        let xml = DomainBuilder::new()
            .with_name("test")
            .with_cpu_model("Skylake-Client")
            .build_xml()
            .unwrap();
        assert!(xml.contains("cpu mode=\"custom\""));
        assert!(xml.contains("<model fallback=\"allow\">Skylake-Client</model>"));

        let xml = DomainBuilder::new().with_name("test").build_xml().unwrap();
        assert!(xml.contains("cpu mode=\"host-passthrough\""));
    }
}
