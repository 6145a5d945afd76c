// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! PID 1 entry point: wires every component in `libbooster` together in
//! the order §4 lays out — kernel bootstrap, cmdline/config, module
//! loading, the uevent engine, LUKS/Clevis unlock, LVM activation,
//! network bringup, and finally root mount + switch-root.

use anyhow::{Context, Result};
use libbooster::blockdev::{self, open_blockdev};
use libbooster::clevis;
use libbooster::cmdline::ParsedCmdline;
use libbooster::config::Config;
use libbooster::console::Console;
use libbooster::devmapper::{self, DeviceMapper, Target};
use libbooster::kernel::{self, PseudoFilesystems};
use libbooster::kmsg;
use libbooster::luks;
use libbooster::lvm::{self, VolumeGroup};
use libbooster::modload::{ModuleIndex, ModuleLoader};
use libbooster::network::{self, NetworkHandle};
use libbooster::probe;
use libbooster::rootmount;
use libbooster::state::{
    BlockDevice, BlockDeviceArena, BlockFormat, ModuleTable, RequiredDeviceId, RequiredDeviceSet,
};
use libbooster::uevent::{self, Subsystem, Uevent, UeventSocket};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const EMERGENCY_SHELL_PATH: &str = "/bin/booster-emergency-shell";

/// Shared, process-wide wiring for everything a uevent dispatch needs to
/// touch. One instance lives for the whole boot; cloned as `Arc` handles
/// into the uevent-processing thread and the main thread alike (§5).
struct Runtime {
    arena: Arc<BlockDeviceArena>,
    dm: Arc<DeviceMapper>,
    loader: Arc<ModuleLoader>,
    required: Arc<RequiredDeviceSet>,
    cmdline: ParsedCmdline,
    config: Config,
    network: Mutex<Option<NetworkHandle>>,
    resolved_root: Mutex<Option<ResolvedRoot>>,
    created_dm_names: Mutex<Vec<String>>,
    lvm_pv_devpaths: Mutex<HashMap<String, String>>,
    lvm_vgs: Mutex<HashMap<String, VolumeGroup>>,
    /// vg_name -> (pv_ref_name -> pv_uuid), extracted from whichever PV's
    /// raw metadata text was most recently read for that VG (every PV in
    /// a VG carries an identical copy of the `physical_volumes` block).
    lvm_pv_refs: Mutex<HashMap<String, HashMap<String, String>>>,
    lvm_activated: Mutex<std::collections::HashSet<String>>,
    synthetic_minor: AtomicU32,
}

struct ResolvedRoot {
    devpath: String,
    format: BlockFormat,
    mount_options: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        // kmsg may not even be installed yet if bootstrap itself failed;
        // log::error! is a no-op with no logger installed, so make sure
        // at least the fallback stderr logger is up before we get here.
        log::error!("fatal: {:#}", err);
        emergency_exit();
    }
}

fn run() -> Result<()> {
    let pseudo = match kernel::bootstrap() {
        Ok(p) => p,
        Err(err) => {
            kmsg::init_fallback_stderr(false);
            log::error!("fatal: kernel bootstrap failed: {:#}", err);
            emergency_exit();
        }
    };

    let cmdline = ParsedCmdline::from_proc().unwrap_or_else(|err| {
        kmsg::init_fallback_stderr(false);
        log::warn!("reading /proc/cmdline: {:#}; continuing with no karg overrides", err);
        ParsedCmdline::parse("")
    });

    if let Err(err) = kmsg::init(cmdline.debug) {
        kmsg::init_fallback_stderr(cmdline.debug);
        log::warn!("opening /dev/kmsg: {:#}; logging to stderr instead", err);
    }
    log::info!("booster-init starting");

    let config = Config::load_default().unwrap_or_else(|err| {
        log::warn!("loading config: {:#}; using defaults", err);
        Config::default()
    });

    let dm = Arc::new(DeviceMapper::open().context("opening device-mapper control")?);
    let module_index = ModuleIndex::load_default().unwrap_or_else(|err| {
        log::warn!("loading modules.dep: {:#}; module loading disabled", err);
        ModuleIndex::default()
    });
    let module_table = ModuleTable::new();
    let loader = Arc::new(ModuleLoader::new(
        module_index,
        module_table,
        cmdline.disable_concurrent_module_loading,
    ));

    let required = RequiredDeviceSet::new(rootmount::required_devices(&cmdline));
    if required.is_empty() {
        log::warn!("no root= on the kernel cmdline; nothing to wait for");
    }

    let rt = Arc::new(Runtime {
        arena: BlockDeviceArena::new(),
        dm,
        loader,
        required,
        cmdline,
        config,
        network: Mutex::new(None),
        resolved_root: Mutex::new(None),
        created_dm_names: Mutex::new(Vec::new()),
        lvm_pv_devpaths: Mutex::new(HashMap::new()),
        lvm_vgs: Mutex::new(HashMap::new()),
        lvm_pv_refs: Mutex::new(HashMap::new()),
        lvm_activated: Mutex::new(std::collections::HashSet::new()),
        synthetic_minor: AtomicU32::new(1),
    });

    for name in rt.config.modules_force_load.iter() {
        let params = rt.cmdline.module_param_string(name);
        if let Err(err) = rt.loader.load(name, params.as_deref()) {
            log::warn!("force-loading module {}: {:#}", name, err);
        }
    }

    if let Some(net_cfg) = rt.config.network.clone() {
        match bring_up_network(&net_cfg) {
            Ok(Some(handle)) => *rt.network.lock().expect("network handle poisoned") = Some(handle),
            Ok(None) => log::warn!("no network interface matched configuration"),
            Err(err) => log::warn!("network bringup failed: {:#}", err),
        }
    }

    if rt.config.enable_virtual_console {
        let _ = libbooster::console::load_virtual_console_resources(
            Path::new("/etc/booster/console.font"),
            Path::new("/etc/booster/console.keymap"),
        );
    }

    spawn_uevent_thread(rt.clone());

    if rt.required.is_empty() {
        emergency_exit();
    }

    if rootmount::wait_for_required_devices(&rt.required, &rt.config).is_err() {
        rt.dm.teardown_all();
        emergency_exit();
    }

    let resolved = rt
        .resolved_root
        .lock()
        .expect("resolved root poisoned")
        .take()
        .context("root device resolved in the required set but not recorded")?;
    let fstype = rootmount::fstype_name(resolved.format)
        .with_context(|| format!("{} has no mountable filesystem type", resolved.devpath))?;
    rootmount::mount_root(&resolved.devpath, fstype, &resolved.mount_options)?;

    for name in rt.created_dm_names.lock().expect("dm registry poisoned").drain(..) {
        rt.dm.hand_off(&name);
    }

    rootmount::switch_root(pseudo, rt.cmdline.init_path())?;
    Ok(())
}

fn emergency_exit() -> ! {
    log::error!("entering emergency shell");
    if let Err(err) = libbooster::console::exec_emergency_shell(Path::new(EMERGENCY_SHELL_PATH)) {
        log::error!("no emergency shell available: {:#}", err);
    }
    std::process::exit(1)
}

fn bring_up_network(cfg: &libbooster::config::NetworkConfig) -> Result<Option<NetworkHandle>> {
    let available = available_interfaces()?;
    let mut handles = network::bring_up(cfg, &available)?;
    Ok(handles.pop())
}

fn available_interfaces() -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net").context("listing /sys/class/net")? {
        let entry = entry.context("reading /sys/class/net entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != "lo" {
            out.push(name);
        }
    }
    Ok(out)
}

/// Spawns the thread that owns the uevent socket for the rest of the
/// process's life (§5): processes the synthesized startup snapshot, then
/// blocks on `recv` forever, dispatching as events arrive.
fn spawn_uevent_thread(rt: Arc<Runtime>) {
    std::thread::spawn(move || {
        for ev in uevent::synthesize_block_add_events().unwrap_or_default() {
            dispatch(&rt, ev);
        }
        let socket = match UeventSocket::open() {
            Ok(s) => s,
            Err(err) => {
                log::error!("opening uevent socket: {:#}", err);
                return;
            }
        };
        loop {
            match socket.recv() {
                Ok(buf) => match uevent::parse(&buf) {
                    Ok(ev) => dispatch(&rt, ev),
                    Err(err) => log::warn!("malformed uevent dropped: {:#}", err),
                },
                Err(err) => {
                    log::error!("reading uevent socket: {:#}", err);
                    return;
                }
            }
        }
    });
}

fn dispatch(rt: &Arc<Runtime>, ev: Uevent) {
    match uevent::classify_subsystem(&ev) {
        Some(Subsystem::Block) => {
            if let Err(err) = uevent::require_devpath_nonempty(&ev) {
                log::warn!("{:#}", err);
                return;
            }
            if let Err(err) = handle_block_event(rt, &ev) {
                log::warn!("handling block uevent for {}: {:#}", ev.devpath, err);
            }
        }
        Some(Subsystem::Drivers) => {
            log::debug!("driver bind event: {}", ev.devpath);
        }
        Some(Subsystem::Net) => {
            log::debug!("net device event: {}", ev.devpath);
        }
        None => {}
    }
}

fn handle_block_event(rt: &Arc<Runtime>, ev: &Uevent) -> Result<()> {
    let devid = match ev.major_minor() {
        Some(id) => id,
        None => return Ok(()),
    };
    if ev.action == "remove" {
        rt.arena.remove(devid);
        return Ok(());
    }
    if ev.action != "add" && ev.action != "change" {
        return Ok(());
    }
    let devname = match ev.devname() {
        Some(d) => d,
        None => return Ok(()),
    };
    let devpath = format!("/dev/{}", devname);
    probe_and_dispatch(rt, &devpath, devid)
}

/// Opens `devpath`, classifies it, records it in the arena, checks it
/// against the required-device set, and fans out to the unlock/activate
/// path for its format (§4.B-§4.J). Shared between live uevent dispatch
/// and the eager re-probe issued right after a dm device is created,
/// since both need identical handling.
fn probe_and_dispatch(
    rt: &Arc<Runtime>,
    devpath: &str,
    devid: libbooster::state::DevId,
) -> Result<()> {
    let mut file = match open_blockdev(Path::new(devpath)) {
        Ok(f) => f,
        Err(err) => {
            log::warn!("opening {}: {:#}", devpath, err);
            return Ok(());
        }
    };
    let classification = probe::classify(&mut file)?;
    let dev = BlockDevice {
        devid,
        devpath: devpath.to_string(),
        format: classification.format,
        uuid: classification.uuid,
        label: classification.label,
        parent: None,
    };
    rt.arena.insert(dev.clone());
    check_required(rt, &dev, &[]);

    match dev.format {
        BlockFormat::Luks1 | BlockFormat::Luks2 => handle_luks(rt, &mut file, &dev),
        BlockFormat::Empty if rt.config.enable_lvm => handle_lvm_candidate(rt, &mut file, &dev),
        _ => Ok(()),
    }
}

/// Marks any pending `RequiredDevice` that `dev` (or one of its known
/// aliases, e.g. a dm-mapper path) satisfies, and remembers the concrete
/// devpath/format for the root mount once the Root purpose resolves.
fn check_required(rt: &Arc<Runtime>, dev: &BlockDevice, aliases: &[String]) {
    for required in rt.required.pending_snapshot() {
        let matches = match &required.id {
            RequiredDeviceId::Uuid(u) => dev.uuid_string().as_deref() == Some(u.as_str()),
            RequiredDeviceId::Label(l) => dev.label.as_deref() == Some(l.as_str()),
            RequiredDeviceId::Path(p) => dev.devpath == *p || aliases.iter().any(|a| a == p),
            RequiredDeviceId::DmName(n) => {
                let mapper_path = format!("/dev/mapper/{}", n);
                dev.devpath == mapper_path || aliases.iter().any(|a| a == &mapper_path)
            }
        };
        if !matches {
            continue;
        }
        rt.required.mark_resolved(&required.id);
        if required.purpose == libbooster::state::RequiredPurpose::Root {
            *rt.resolved_root.lock().expect("resolved root poisoned") = Some(ResolvedRoot {
                devpath: dev.devpath.clone(),
                format: dev.format,
                mount_options: required.mount_options.clone(),
            });
        }
    }
}

/// Handles a classified LUKS1/2 device (§4.F, §4.G): loads the crypto
/// modules, and — only for volumes the cmdline actually names with
/// `rd.luks.uuid=` — unlocks and activates it as a dm-crypt mapping.
fn handle_luks(rt: &Arc<Runtime>, file: &mut std::fs::File, dev: &BlockDevice) -> Result<()> {
    for module in ["dm-mod", "dm-crypt"] {
        if let Err(err) = rt.loader.load(module, None) {
            log::debug!("loading {} (may already be built in): {:#}", module, err);
        }
    }

    let volume = luks::parse_header(file)?;
    let requirement = rt.cmdline.luks.iter().find(|l| l.uuid == volume.uuid);
    let requirement = match requirement {
        Some(r) => r,
        None => {
            log::debug!("LUKS volume {} is not named by rd.luks.uuid=, leaving locked", volume.uuid);
            return Ok(());
        }
    };
    let name = requirement.activation_name();

    let mut master_key = recover_master_key(rt, file, &volume, &name)?;
    let flags = devmapper::parse_luks_options(&rt.cmdline.luks_options.join(","));
    let (cipher, key_hex) = devmapper::format_crypt_params(&volume.cipher, &master_key);
    luks::clear_sensitive(&mut master_key);

    let size_sectors = blockdev::device_size(file)? / 512;
    let length = size_sectors.saturating_sub(volume.payload_offset);
    let table = vec![(
        0u64,
        length,
        Target::Crypt {
            cipher,
            key_hex,
            iv_offset: 0,
            device: dev.devpath.clone(),
            offset: volume.payload_offset,
            flags,
        },
    )];

    rt.dm.create(&name, Some(&volume.uuid))?;
    rt.created_dm_names.lock().expect("dm registry poisoned").push(name.clone());
    rt.dm.load(&name, &table)?;
    rt.dm.resume(&name)?;
    log::info!("unlocked LUKS volume {} as /dev/mapper/{}", volume.uuid, name);

    let mapper_path = format!("/dev/mapper/{}", name);
    let minor = rt.synthetic_minor.fetch_add(1, Ordering::SeqCst);
    probe_and_dispatch(rt, &mapper_path, (253, minor))
}

/// Tries every Clevis-bound slot before falling back to an interactive
/// passphrase, up to three attempts (§4.F, §4.G, §4.K).
fn recover_master_key(
    rt: &Arc<Runtime>,
    file: &mut std::fs::File,
    volume: &luks::CryptoVolume,
    name: &str,
) -> Result<Vec<u8>> {
    let network = rt.network.lock().expect("network handle poisoned");
    for (_, token) in luks::clevis_bound_slots(volume) {
        match clevis::recover(&token.jwe, network.as_ref()) {
            Ok(secret) => match luks::try_unlock(file, volume, &secret) {
                Ok(key) => return Ok(key),
                Err(err) => log::debug!("clevis-recovered secret didn't unlock any slot: {:#}", err),
            },
            Err(err) => log::debug!("clevis recovery failed: {:#}", err),
        }
    }
    drop(network);

    let mut console = Console::open().context("opening console for passphrase prompt")?;
    let mut last_err = anyhow::anyhow!("no passphrase attempts made");
    for attempt in 1..=3 {
        let prompt = format!("Enter passphrase for {}: ", name);
        let mut passphrase = console.read_passphrase(&prompt)?;
        let result = luks::try_unlock(file, volume, &passphrase);
        luks::clear_sensitive(&mut passphrase);
        match result {
            Ok(key) => return Ok(key),
            Err(err) => {
                log::warn!("passphrase attempt {} for {} failed: {:#}", attempt, name, err);
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Checks an unclassified device for the LVM2 label, folds its metadata
/// into the known-VG map, and activates anything that's now fully
/// resolvable (§4.I).
fn handle_lvm_candidate(rt: &Arc<Runtime>, file: &mut std::fs::File, dev: &BlockDevice) -> Result<()> {
    const LABEL_OFFSET: u64 = 0x218;
    let mut head = vec![0u8; 4096];
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(0)).context("seeking to LVM probe window")?;
    if file.read_exact(&mut head).is_err() {
        return Ok(());
    }
    if !lvm::is_lvm_pv(&head) {
        return Ok(());
    }

    let pv = lvm::read_pv_header(file, &dev.devpath)?;
    rt.lvm_pv_devpaths
        .lock()
        .expect("lvm pv map poisoned")
        .insert(pv.pv_uuid.clone(), dev.devpath.clone());

    let metadata_text = read_vg_metadata_text(file, LABEL_OFFSET)?;
    let vg = lvm::parse_metadata(&metadata_text)?;
    let vg_name = vg.name.clone();

    let mut refs = HashMap::new();
    for lv in &vg.lvs {
        for (pv_ref, _, _) in &lv.segments {
            if let Some(uuid) = lvm::pv_uuid_for_ref(&metadata_text, pv_ref) {
                refs.insert(pv_ref.clone(), uuid);
            }
        }
    }
    rt.lvm_pv_refs.lock().expect("lvm pv ref map poisoned").insert(vg_name.clone(), refs);
    rt.lvm_vgs.lock().expect("lvm vg map poisoned").insert(vg_name.clone(), vg);

    try_activate_vg(rt, &vg_name)
}

/// Reads the free-form LVM2 metadata text area a PV's label points to,
/// following the same metadata-area descriptor `lvm::read_vg_metadata`
/// parses, but returning the raw text so callers can also resolve
/// `physical_volumes` ref names via `lvm::pv_uuid_for_ref`.
fn read_vg_metadata_text<R: std::io::Read + std::io::Seek>(dev: &mut R, label_offset: u64) -> Result<String> {
    use std::io::SeekFrom;
    let mut descriptor = [0u8; 16];
    dev.seek(SeekFrom::Start(label_offset + 40))
        .context("seeking to LVM metadata area descriptor")?;
    dev.read_exact(&mut descriptor)
        .context("reading LVM metadata area descriptor")?;
    let meta_offset = u64::from_le_bytes(descriptor[0..8].try_into().unwrap());
    let meta_size = u64::from_le_bytes(descriptor[8..16].try_into().unwrap());
    if meta_offset == 0 || meta_size == 0 || meta_size > 16 * 1024 * 1024 {
        anyhow::bail!("LVM metadata area descriptor looks invalid");
    }
    dev.seek(SeekFrom::Start(meta_offset))
        .context("seeking to LVM metadata text area")?;
    let mut buf = vec![0u8; meta_size as usize];
    dev.read_exact(&mut buf)
        .context("reading LVM metadata text area")?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn try_activate_vg(rt: &Arc<Runtime>, vg_name: &str) -> Result<()> {
    let vg = match rt.lvm_vgs.lock().expect("lvm vg map poisoned").get(vg_name).cloned() {
        Some(vg) => vg,
        None => return Ok(()),
    };
    let pv_devpaths = rt.lvm_pv_devpaths.lock().expect("lvm pv map poisoned").clone();
    let refs = rt
        .lvm_pv_refs
        .lock()
        .expect("lvm pv ref map poisoned")
        .get(vg_name)
        .cloned()
        .unwrap_or_default();

    let mut pvs_by_name = HashMap::new();
    for lv in &vg.lvs {
        for (pv_ref, _, _) in &lv.segments {
            if pvs_by_name.contains_key(pv_ref) {
                continue;
            }
            if let Some(uuid) = refs.get(pv_ref) {
                if let Some(devpath) = pv_devpaths.get(uuid) {
                    pvs_by_name.insert(pv_ref.clone(), devpath.clone());
                }
            }
        }
    }

    for lv in &vg.lvs {
        let dm_name = format!("{}-{}", vg.name, lv.name);
        if rt.lvm_activated.lock().expect("lvm activated set poisoned").contains(&dm_name) {
            continue;
        }
        let all_present = lv.segments.iter().all(|(pv_ref, _, _)| pvs_by_name.contains_key(pv_ref));
        if !all_present {
            log::debug!("LV {} not yet activatable, waiting on more physical volumes", dm_name);
            continue;
        }
        let single_vg = VolumeGroup {
            name: vg.name.clone(),
            extent_size_sectors: vg.extent_size_sectors,
            lvs: vec![lv.clone()],
        };
        match lvm::activate(&rt.dm, &single_vg, &pvs_by_name) {
            Ok(names) => {
                rt.created_dm_names.lock().expect("dm registry poisoned").extend(names.clone());
                rt.lvm_activated.lock().expect("lvm activated set poisoned").insert(dm_name.clone());
                let mapper_path = format!("/dev/mapper/{}", dm_name);
                let alt_path = format!("/dev/{}/{}", vg.name, lv.name);
                let minor = rt.synthetic_minor.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = probe_and_dispatch_with_aliases(rt, &mapper_path, (253, minor), &[alt_path]) {
                    log::warn!("probing activated LV {}: {:#}", dm_name, err);
                }
            }
            Err(err) => log::warn!("activating LV {}: {:#}", dm_name, err),
        }
    }
    Ok(())
}

fn probe_and_dispatch_with_aliases(
    rt: &Arc<Runtime>,
    devpath: &str,
    devid: libbooster::state::DevId,
    aliases: &[String],
) -> Result<()> {
    let mut file = match open_blockdev(Path::new(devpath)) {
        Ok(f) => f,
        Err(err) => {
            log::warn!("opening {}: {:#}", devpath, err);
            return Ok(());
        }
    };
    let classification = probe::classify(&mut file)?;
    let dev = BlockDevice {
        devid,
        devpath: devpath.to_string(),
        format: classification.format,
        uuid: classification.uuid,
        label: classification.label,
        parent: None,
    };
    rt.arena.insert(dev.clone());
    check_required(rt, &dev, aliases);
    Ok(())
}
