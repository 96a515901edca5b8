//! Hypervisor argv construction (spec §6.4). The argv, file-descriptor
//! ordering, and virtio device roles are the specified contract; the
//! concrete binary itself is an external collaborator.

use runq_core::descriptor::Data;

/// Target architecture, selecting console/bus/RNG variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    S390x,
}

impl Arch {
    fn bus(self) -> &'static str {
        match self {
            Arch::Amd64 => "pci",
            Arch::S390x => "ccw",
        }
    }

    fn binary(self) -> &'static str {
        match self {
            Arch::Amd64 => "qemu-system-x86_64",
            Arch::S390x => "qemu-system-s390x",
        }
    }
}

/// Inputs the argv builder needs beyond the descriptor itself.
pub struct HypervisorConfig<'a> {
    pub arch: Arch,
    pub data: &'a Data,
    pub channel_socket_path: &'a str,
    pub share_dir: &'a str,
    pub share_mount_tag: &'a str,
    /// Number of tap devices handed over as extra file descriptors,
    /// starting at FD 3, in descriptor order.
    pub tap_count: usize,
    /// Gated s390x 9p workaround (SPEC_FULL.md supplement 4); never
    /// derived from a hypervisor version string.
    pub multidevs_remap: bool,
}

/// Builds the full hypervisor argv, following spec §6.4's contract plus the
/// per-arch device variants observed in the original implementation's
/// `qemuConfig`.
pub fn build_argv(cfg: &HypervisorConfig) -> Vec<String> {
    let mut argv = vec![cfg.arch.binary().to_string()];
    let push = |argv: &mut Vec<String>, s: &str| argv.push(s.to_string());

    push(&mut argv, "-machine");
    push(&mut argv, "accel=kvm,usb=off");
    push(&mut argv, "-enable-kvm");
    push(&mut argv, "-cpu");
    push(&mut argv, &cfg.data.cpu_args);
    push(&mut argv, "-smp");
    argv.push(cfg.data.cpu.to_string());
    push(&mut argv, "-m");
    argv.push(cfg.data.mem_mib.to_string());
    push(&mut argv, "-kernel");
    push(&mut argv, "/kernel");
    push(&mut argv, "-initrd");
    push(&mut argv, "/initrd");
    push(&mut argv, "-append");
    push(&mut argv, runq_core::cfg::KERNEL_PARAMETERS);
    push(&mut argv, "-nographic");
    push(&mut argv, "-no-reboot");
    push(&mut argv, "-no-user-config");
    push(&mut argv, "-nodefaults");
    push(&mut argv, "-monitor");
    push(&mut argv, "none");
    push(&mut argv, "-msg");
    push(&mut argv, "timestamp=on");
    push(&mut argv, "-name");
    let short_id: String = cfg.data.container_id.chars().take(12).collect();
    argv.push(short_id);

    if cfg.data.nested_vm {
        push(&mut argv, "-cpu");
        let mut cpu = cfg.data.cpu_args.clone();
        cpu.push_str(",pmu=off");
        argv.push(cpu);
    }

    // virtio-rng
    let bus = cfg.arch.bus();
    push(&mut argv, "-object");
    argv.push("rng-random,filename=/dev/urandom,id=rng0".to_string());
    push(&mut argv, "-device");
    argv.push(format!("virtio-rng-{bus},rng=rng0"));

    // virtio-9p share
    push(&mut argv, "-fsdev");
    let mut fsdev = format!(
        "local,id=rootfs_dev,path={},security_model=none",
        cfg.share_dir
    );
    if cfg.arch == Arch::S390x && cfg.multidevs_remap {
        fsdev.push_str(",multidevs=remap");
    }
    argv.push(fsdev);
    push(&mut argv, "-device");
    argv.push(format!(
        "virtio-9p-{bus},fsdev=rootfs_dev,mount_tag={}",
        cfg.share_mount_tag
    ));

    // virtio-serial control channel (C2)
    push(&mut argv, "-chardev");
    argv.push(format!("socket,path={},id=channel1", cfg.channel_socket_path));
    push(&mut argv, "-device");
    argv.push(format!("virtio-serial-{bus}"));
    push(&mut argv, "-device");
    argv.push("virtserialport,chardev=channel1,name=com.ibm.runq.channel.1".to_string());

    // console
    push(&mut argv, "-chardev");
    push(&mut argv, "stdio,id=console,signal=off");
    match cfg.arch {
        Arch::Amd64 => {
            push(&mut argv, "-serial");
            push(&mut argv, "chardev:console");
        }
        Arch::S390x => {
            push(&mut argv, "-device");
            argv.push("sclpconsole,chardev=console".to_string());
        }
    }

    // vsock
    if let Some(vsockd) = &cfg.data.vsockd {
        if vsockd.cid != 0 {
            push(&mut argv, "-device");
            argv.push(format!("vhost-vsock-{bus},guest-cid={}", vsockd.cid));
        }
    }

    // disks
    if !cfg.data.disks.is_empty() {
        push(&mut argv, "-object");
        push(&mut argv, "iothread,id=iothread1");
    }
    for (i, disk) in cfg.data.disks.iter().enumerate() {
        let fmt = match disk.disk_type {
            runq_core::descriptor::DiskType::Qcow2Image => "qcow2",
            _ => "raw",
        };
        let aio = if disk.cache == "none" { "native" } else { "threads" };
        push(&mut argv, "-drive");
        argv.push(format!(
            "file={},if=none,format={},cache={},aio={},id=disk{}",
            disk.path, fmt, disk.cache, aio, i
        ));
        push(&mut argv, "-device");
        argv.push(format!(
            "virtio-blk-{bus},serial={},drive=disk{},iothread=iothread1",
            disk.serial, i
        ));
    }

    // AP device (s390x crypto passthrough)
    if let Some(apdev) = &cfg.data.ap_device {
        push(&mut argv, "-device");
        argv.push(format!("vfio-ap,sysfsdev={apdev}"));
    }

    // network: tap devices as explicit FDs starting at 3, in descriptor order
    for (i, net) in cfg.data.networks.iter().enumerate() {
        let fd = 3 + i;
        push(&mut argv, "-device");
        argv.push(format!("virtio-net-{bus},netdev=net{i},mac={}", net.mac_address));
        push(&mut argv, "-netdev");
        argv.push(format!("tap,id=net{i},vhost=on,fd={fd}"));
    }

    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use runq_core::descriptor::*;
    use std::collections::HashMap;

    fn sample_data() -> Data {
        Data {
            container_id: "deadbeefcafebabe0011223344556677".into(),
            git_commit: "abc".into(),
            cpu: 2,
            cpu_args: "host".into(),
            mem_mib: 1024,
            nested_vm: false,
            hostname: "box".into(),
            sysctl: HashMap::new(),
            disks: vec![],
            root_disk_id: None,
            networks: vec![],
            dns: Dns::default(),
            mounts: vec![],
            masked_paths: vec![],
            readonly_paths: vec![],
            entrypoint: Entrypoint {
                user: User { uid: 0, gid: 0 },
                additional_gids: vec![],
                args: vec!["/bin/sh".into()],
                capabilities: AppCapabilities::default(),
                cwd: "/".into(),
                docker_init: String::new(),
                env: vec![],
                no_new_privileges: false,
                rlimits: HashMap::new(),
                seccomp: vec![],
                systemd: false,
                terminal: false,
                runqenv: false,
            },
            vsockd: None,
            ap_device: None,
            no_exec: false,
        }
    }

    #[test]
    fn test_build_argv_contains_required_flags() {
        let data = sample_data();
        let cfg = HypervisorConfig {
            arch: Arch::Amd64,
            data: &data,
            channel_socket_path: "/run/runq.sock",
            share_dir: "/rootfs",
            share_mount_tag: "rootfs",
            tap_count: 0,
            multidevs_remap: false,
        };
        let argv = build_argv(&cfg);
        assert_eq!(argv[0], "qemu-system-x86_64");
        assert!(argv.contains(&"-enable-kvm".to_string()));
        assert!(argv.contains(&"-kernel".to_string()));
        assert!(argv.windows(2).any(|w| w == ["-smp", "2"]));
        assert!(argv.windows(2).any(|w| w == ["-m", "1024"]));
        assert!(argv
            .iter()
            .any(|s| s.contains("socket,path=/run/runq.sock,id=channel1")));
    }

    #[test]
    fn test_build_argv_s390x_uses_ccw_bus_and_sclpconsole() {
        let data = sample_data();
        let cfg = HypervisorConfig {
            arch: Arch::S390x,
            data: &data,
            channel_socket_path: "/run/runq.sock",
            share_dir: "/rootfs",
            share_mount_tag: "rootfs",
            tap_count: 0,
            multidevs_remap: false,
        };
        let argv = build_argv(&cfg);
        assert!(argv.iter().any(|s| s.contains("virtio-serial-ccw")));
        assert!(argv.iter().any(|s| s.contains("sclpconsole")));
    }

    #[test]
    fn test_build_argv_includes_vsock_device_when_cid_set() {
        let mut data = sample_data();
        data.vsockd = Some(Vsockd {
            certificates: Certificates {
                ca_cert: vec![],
                cert: vec![],
                key: vec![],
            },
            entrypoint_pid: None,
            entrypoint_env: vec![],
            cid: 0xdeadbeef,
        });
        let cfg = HypervisorConfig {
            arch: Arch::Amd64,
            data: &data,
            channel_socket_path: "/run/runq.sock",
            share_dir: "/rootfs",
            share_mount_tag: "rootfs",
            tap_count: 0,
            multidevs_remap: false,
        };
        let argv = build_argv(&cfg);
        assert!(argv.iter().any(|s| s.contains("vhost-vsock-pci,guest-cid=3735928559")));
    }

    #[test]
    fn test_build_argv_disk_serial_present() {
        let mut data = sample_data();
        data.disks.push(Disk {
            id: "d1".into(),
            path: "/rootfs/disks/d1.img".into(),
            cache: "none".into(),
            dir: None,
            fstype: None,
            mount: false,
            serial: "abcdef012345".into(),
            disk_type: DiskType::RawFile,
            options: vec![],
        });
        let cfg = HypervisorConfig {
            arch: Arch::Amd64,
            data: &data,
            channel_socket_path: "/run/runq.sock",
            share_dir: "/rootfs",
            share_mount_tag: "rootfs",
            tap_count: 0,
            multidevs_remap: false,
        };
        let argv = build_argv(&cfg);
        assert!(argv.iter().any(|s| s.contains("serial=abcdef012345")));
        assert!(argv.iter().any(|s| s == "iothread,id=iothread1"));
    }

    #[test]
    fn test_build_argv_network_fds_start_at_three() {
        let mut data = sample_data();
        data.networks.push(Network {
            name: "eth0".into(),
            mac_address: "02:00:00:00:00:01".into(),
            mtu: 1500,
            addrs: vec![],
            gateway: None,
            tap_device: "/dev/tap0".into(),
        });
        let cfg = HypervisorConfig {
            arch: Arch::Amd64,
            data: &data,
            channel_socket_path: "/run/runq.sock",
            share_dir: "/rootfs",
            share_mount_tag: "rootfs",
            tap_count: 1,
            multidevs_remap: false,
        };
        let argv = build_argv(&cfg);
        assert!(argv.iter().any(|s| s.contains("tap,id=net0,vhost=on,fd=3")));
    }
}
