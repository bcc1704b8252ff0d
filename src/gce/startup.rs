//! Startup script rendering and instance spec construction.
//!
//! The startup script is the only provisioning the guest receives: it
//! optionally schedules a hard poweroff through `at` and installs the
//! worker's public key for the `travis` user. Everything else ships in
//! the boot image.

use uuid::Uuid;

use crate::backend::StartAttributes;

use super::ResolvedTargets;
use super::api::{
    AccessConfig, AttachedDisk, InitializeParams, Instance, Metadata, MetadataItem,
    NetworkInterface, Scheduling, ServiceAccount, Tags,
};
use super::settings::InstanceConfig;

const USERINFO_EMAIL_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";
const DEVSTORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";

/// Renders the guest startup script for this provider's instance config.
pub(super) fn render_startup_script(config: &InstanceConfig) -> String {
    let implode = if config.auto_implode {
        format!(
            "echo poweroff | at now + {} minutes",
            config.hard_timeout_minutes
        )
    } else {
        String::new()
    };

    format!(
        "#!/usr/bin/env bash\n{implode}\ncat > ~travis/.ssh/authorized_keys <<EOF\n{}\nEOF\n",
        config.ssh_pub_key
    )
}

/// Builds the declarative spec for one fresh, preemptible test VM.
pub(super) fn build_instance_spec(
    config: &InstanceConfig,
    targets: &ResolvedTargets,
    attrs: &StartAttributes,
    image_link: &str,
    startup_script: String,
) -> Instance {
    Instance {
        name: format!("testing-gce-{}", Uuid::new_v4()),
        description: format!("Travis CI {} test VM", attrs.language),
        machine_type: targets.machine_type.self_link.clone(),
        disks: vec![AttachedDisk {
            disk_type: String::from("PERSISTENT"),
            mode: String::from("READ_WRITE"),
            boot: true,
            auto_delete: true,
            initialize_params: InitializeParams {
                source_image: image_link.to_owned(),
                disk_type: targets.disk_type.clone(),
                disk_size_gb: config.disk_size,
            },
        }],
        scheduling: Scheduling { preemptible: true },
        metadata: Metadata {
            items: vec![MetadataItem {
                key: String::from("startup-script"),
                value: startup_script,
            }],
        },
        network_interfaces: vec![NetworkInterface {
            network: targets.network.self_link.clone(),
            access_configs: vec![AccessConfig {
                name: String::from("External NAT"),
                config_type: String::from("ONE_TO_ONE_NAT"),
                nat_ip: String::new(),
            }],
        }],
        service_accounts: vec![ServiceAccount {
            email: String::from("default"),
            scopes: vec![
                String::from(USERINFO_EMAIL_SCOPE),
                String::from(DEVSTORAGE_SCOPE),
                String::from(COMPUTE_SCOPE),
            ],
        }],
        tags: Tags {
            items: vec![String::from("testing")],
        },
        ..Instance::default()
    }
}
