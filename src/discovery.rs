//! The debug-info discovery pipeline.
//!
//! Given user-supplied ELF paths and/or permission to search the
//! standard on-disk locations, the pipeline identifies vmlinux and
//! kernel-module files, matches modules against the kernel's loaded
//! set by GNU build ID, patches their section addresses, and hands
//! everything to the downstream [`DebugIndexer`].
//!
//! Per-file failures are routed through the indexer's error sink and
//! the pipeline carries on; the sink decides what is fatal. Anything
//! already reported stays reported even when a later file fails.

use crate::depmod::DepmodIndex;
use crate::domain::errors::{DiscoveryError, Result};
use crate::domain::types::ElfKind;
use crate::elf::ElfResource;
use crate::modules::KernelModuleIterator;
use crate::target::{use_proc_and_sys_modules, KernelData, SystemRoot};
use crate::vmcoreinfo::Vmcoreinfo;
use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name under which vmlinux is reported to the indexer.
pub const VMLINUX_NAME: &str = "kernel";

/// The downstream DWARF indexer.
///
/// `report_elf` transfers ownership of the file; the return value says
/// whether the file is new to the indexer. `report_error` is the
/// error sink: returning `Err` makes the failure fatal and aborts the
/// pipeline, returning `Ok(())` lets it continue with the next file.
pub trait DebugIndexer {
    fn report_elf(
        &mut self,
        elf: ElfResource,
        start: u64,
        end: u64,
        name: Option<&str>,
    ) -> Result<bool>;

    fn is_indexed(&self, name: &str) -> bool;

    /// Index everything reported so far.
    fn flush(&mut self) -> Result<()>;

    fn report_error(
        &mut self,
        name: Option<&str>,
        message: Option<&str>,
        cause: Option<DiscoveryError>,
    ) -> Result<()>;
}

/// What one discovery run should load.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// User-supplied ELF paths (vmlinux, modules, or anything else).
    pub paths: Vec<PathBuf>,
    /// Search the standard locations for modules that were not
    /// supplied explicitly.
    pub load_default: bool,
    /// Search the standard locations for vmlinux if it was not
    /// supplied explicitly.
    pub load_main: bool,
}

/// Run the discovery pipeline.
///
/// `live` says whether the inspected kernel is the running one; it
/// decides, together with the environment gate, whether loaded modules
/// are enumerated via `/proc` and `/sys` or by walking kernel memory.
pub fn report_debug_info<K: KernelData, I: DebugIndexer>(
    kernel: &K,
    info: &Vmcoreinfo,
    live: bool,
    root: &SystemRoot,
    options: &LoadOptions,
    indexer: &mut I,
) -> Result<()> {
    Pipeline { kernel, info, live, root, indexer }.run(options)
}

struct Pipeline<'a, K: KernelData, I: DebugIndexer> {
    kernel: &'a K,
    info: &'a Vmcoreinfo,
    live: bool,
    root: &'a SystemRoot,
    indexer: &'a mut I,
}

enum MatchOutcome {
    /// A user-supplied chain was relocated and reported.
    Matched,
    /// The module's build ID could not be determined; the warning has
    /// been routed and the module is skipped entirely.
    Skipped,
    /// No user file matches; the caller may fall back to depmod.
    NoMatch,
}

enum DepmodState {
    Disabled,
    Unopened,
    Open(DepmodIndex),
}

impl<K: KernelData, I: DebugIndexer> Pipeline<'_, K, I> {
    fn run(&mut self, options: &LoadOptions) -> Result<()> {
        // Identify what the user gave us. Modules are set aside until
        // the loaded-module walk; vmlinux may need to be indexed first
        // so that walk can chase struct module through kernel memory.
        let mut module_files = Vec::new();
        let mut vmlinux_pending = false;
        for path in &options.paths {
            let elf = match ElfResource::open(path) {
                Ok(elf) => elf,
                Err(err) => {
                    let label = path_label(path);
                    self.indexer.report_error(Some(&label), None, Some(err))?;
                    continue;
                }
            };
            match elf.kind() {
                ElfKind::Module => module_files.push(elf),
                ElfKind::Vmlinux => {
                    let (start, end) = match elf.address_range(self.info.kaslr_offset) {
                        Ok(range) => range,
                        Err(err) => {
                            let label = path_label(path);
                            self.indexer.report_error(Some(&label), None, Some(err))?;
                            continue;
                        }
                    };
                    if self.indexer.report_elf(elf, start, end, Some(VMLINUX_NAME))? {
                        vmlinux_pending = true;
                    }
                }
                ElfKind::Other => {
                    self.indexer.report_elf(elf, 0, 0, None)?;
                }
            }
        }

        if options.load_main && !vmlinux_pending && !self.indexer.is_indexed(VMLINUX_NAME) {
            vmlinux_pending = self.report_vmlinux()?;
        }

        self.report_kernel_modules(module_files, vmlinux_pending, options.load_default)
    }

    /// Search the standard locations for vmlinux and report it.
    /// Returns whether a newly indexed vmlinux is pending.
    fn report_vmlinux(&mut self) -> Result<bool> {
        let osrelease = &self.info.osrelease;
        let candidates = vmlinux_candidates(self.root, osrelease);
        let elf = match find_elf_file(&candidates) {
            Ok(Some(elf)) => elf,
            Ok(None) => {
                let err =
                    DiscoveryError::other(format!("could not find vmlinux for {osrelease}"));
                self.indexer.report_error(Some(VMLINUX_NAME), None, Some(err))?;
                return Ok(false);
            }
            Err(err) => {
                self.indexer.report_error(None, None, Some(err))?;
                return Ok(false);
            }
        };
        info!("found vmlinux at {}", elf.path().display());
        let (start, end) = match elf.address_range(self.info.kaslr_offset) {
            Ok(range) => range,
            Err(err) => {
                let label = path_label(elf.path());
                self.indexer.report_error(Some(&label), None, Some(err))?;
                return Ok(false);
            }
        };
        self.indexer.report_elf(elf, start, end, Some(VMLINUX_NAME))
    }

    fn report_kernel_modules(
        &mut self,
        module_files: Vec<ElfResource>,
        vmlinux_pending: bool,
        load_default: bool,
    ) -> Result<()> {
        if module_files.is_empty() && !load_default {
            return Ok(());
        }

        // On the running kernel the loaded-module list can come from
        // /proc and /sys; an environment variable can force the
        // kernel-memory walk for testing.
        let use_proc_and_sys = self.live && use_proc_and_sys_modules();
        if vmlinux_pending && !use_proc_and_sys {
            // Walking the in-kernel module list needs vmlinux's debug
            // info for struct module.
            self.indexer.flush()?;
        }

        let match_user_files = !module_files.is_empty();
        let mut table: HashMap<Vec<u8>, Vec<ElfResource>> = HashMap::new();
        for elf in module_files {
            let build_id = match elf.build_id() {
                Ok(id) => id.unwrap_or_default().to_vec(),
                Err(err) => {
                    let label = path_label(elf.path());
                    self.indexer.report_error(Some(&label), None, Some(err))?;
                    continue;
                }
            };
            // Files sharing a build ID chain up in input order.
            table.entry(build_id).or_default().push(elf);
        }

        let mut kmod_it = match KernelModuleIterator::new(self.kernel, self.root, use_proc_and_sys)
        {
            Ok(it) => it,
            Err(err) => {
                self.indexer.report_error(
                    Some("kernel modules"),
                    Some("could not find loaded kernel modules"),
                    Some(err),
                )?;
                return self.report_unloaded(table);
            }
        };

        let mut depmod = if load_default { DepmodState::Unopened } else { DepmodState::Disabled };
        loop {
            match kmod_it.advance() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.indexer.report_error(
                        Some("kernel modules"),
                        Some("could not find loaded kernel modules"),
                        Some(err),
                    )?;
                    break;
                }
            }

            // An explicitly supplied file wins over anything on disk.
            if match_user_files {
                match self.report_loaded_module(&mut kmod_it, &mut table)? {
                    MatchOutcome::Matched | MatchOutcome::Skipped => continue,
                    MatchOutcome::NoMatch => {}
                }
            }

            if matches!(depmod, DepmodState::Disabled) || self.indexer.is_indexed(kmod_it.name())
            {
                continue;
            }
            if matches!(depmod, DepmodState::Unopened) {
                match DepmodIndex::open(self.root, &self.info.osrelease) {
                    Ok(index) => depmod = DepmodState::Open(index),
                    Err(err) => {
                        self.indexer.report_error(
                            Some("kernel modules"),
                            Some("could not read depmod"),
                            Some(err),
                        )?;
                        depmod = DepmodState::Disabled;
                        continue;
                    }
                }
            }
            if let DepmodState::Open(index) = &depmod {
                self.report_default_module(&mut kmod_it, index)?;
            }
        }

        self.report_unloaded(table)
    }

    /// Match the iterator's current module against the user-file table
    /// and report the whole chain under the live address range.
    fn report_loaded_module(
        &mut self,
        kmod_it: &mut KernelModuleIterator<'_, K>,
        table: &mut HashMap<Vec<u8>, Vec<ElfResource>>,
    ) -> Result<MatchOutcome> {
        let name = kmod_it.name().to_owned();
        let build_id = match kmod_it.build_id() {
            Ok(Some(id)) if !id.is_empty() => id.to_vec(),
            Ok(_) => {
                self.indexer.report_error(
                    Some(&name),
                    Some("could not find GNU build ID"),
                    None,
                )?;
                return Ok(MatchOutcome::Skipped);
            }
            Err(err) => {
                self.indexer.report_error(
                    Some(&name),
                    Some("could not find GNU build ID"),
                    Some(err),
                )?;
                return Ok(MatchOutcome::Skipped);
            }
        };
        let Some(chain) = table.remove(&build_id) else {
            return Ok(MatchOutcome::NoMatch);
        };
        debug!("module {name}: {} user file(s) matched by build ID", chain.len());
        for mut elf in chain {
            if let Err(err) = relocate_module_sections(kmod_it, &mut elf) {
                let label = path_label(elf.path());
                self.indexer.report_error(
                    Some(&label),
                    Some("could not get section addresses"),
                    Some(err),
                )?;
                continue;
            }
            self.indexer.report_elf(elf, kmod_it.start(), kmod_it.end(), Some(&name))?;
        }
        Ok(MatchOutcome::Matched)
    }

    /// Find the iterator's current module on disk via the depmod index
    /// and report it.
    fn report_default_module(
        &mut self,
        kmod_it: &mut KernelModuleIterator<'_, K>,
        depmod: &DepmodIndex,
    ) -> Result<()> {
        let name = kmod_it.name().to_owned();
        let depmod_path = match depmod.find(&name) {
            Ok(Some(path)) => path.to_vec(),
            Ok(None) => {
                self.indexer.report_error(
                    Some(&name),
                    Some("could not find module in depmod"),
                    None,
                )?;
                return Ok(());
            }
            Err(err) => {
                self.indexer.report_error(
                    Some("kernel modules"),
                    Some("could not parse depmod"),
                    Some(err),
                )?;
                return Ok(());
            }
        };

        let (stem, extension) = split_compression_suffix(&depmod_path);
        let stem = String::from_utf8_lossy(stem);
        let extension = String::from_utf8_lossy(extension);
        let candidates =
            module_candidates(self.root, &self.info.osrelease, &stem, &extension);
        let mut elf = match find_elf_file(&candidates) {
            Ok(Some(elf)) => elf,
            Ok(None) => {
                self.indexer.report_error(Some(&name), Some("could not find .ko"), None)?;
                return Ok(());
            }
            Err(err) => {
                self.indexer.report_error(None, None, Some(err))?;
                return Ok(());
            }
        };
        debug!("module {name}: using {}", elf.path().display());
        if let Err(err) = relocate_module_sections(kmod_it, &mut elf) {
            let label = path_label(elf.path());
            self.indexer.report_error(
                Some(&label),
                Some("could not get section addresses"),
                Some(err),
            )?;
            return Ok(());
        }
        self.indexer.report_elf(elf, kmod_it.start(), kmod_it.end(), Some(&name))?;
        Ok(())
    }

    /// Anything left in the table was not loaded: report it with a
    /// zero address range, keeping each chain's input order.
    fn report_unloaded(&mut self, table: HashMap<Vec<u8>, Vec<ElfResource>>) -> Result<()> {
        for (_, chain) in table {
            for elf in chain {
                let label = path_label(elf.path());
                self.indexer.report_elf(elf, 0, 0, Some(&label))?;
            }
        }
        Ok(())
    }
}

/// Rewrite the ELF's allocatable section addresses to the module's
/// runtime layout. Kernel sections absent from the file are skipped.
fn relocate_module_sections<K: KernelData>(
    kmod_it: &mut KernelModuleIterator<'_, K>,
    elf: &mut ElfResource,
) -> Result<()> {
    let indexes = elf.alloc_section_indexes()?;
    let mut sections = kmod_it.sections()?;
    while let Some((name, address)) = sections.next_section()? {
        if let Some(&index) = indexes.get(name) {
            elf.set_section_address(index, address)?;
        }
    }
    Ok(())
}

/// Try each candidate in order; the first one that opens wins. A
/// candidate that cannot be opened is skipped, but one that opens and
/// fails to parse is an error.
fn find_elf_file(candidates: &[PathBuf]) -> Result<Option<ElfResource>> {
    for path in candidates {
        match ElfResource::open(path) {
            Ok(elf) => return Ok(Some(elf)),
            Err(DiscoveryError::Os { syscall: "open", .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

fn vmlinux_candidates(root: &SystemRoot, osrelease: &str) -> [PathBuf; 5] {
    // The files under /usr/lib/debug always carry debug info, so they
    // come first.
    [
        root.path(&format!("/usr/lib/debug/boot/vmlinux-{osrelease}")),
        root.path(&format!("/usr/lib/debug/lib/modules/{osrelease}/vmlinux")),
        root.path(&format!("/boot/vmlinux-{osrelease}")),
        root.path(&format!("/lib/modules/{osrelease}/build/vmlinux")),
        root.path(&format!("/lib/modules/{osrelease}/vmlinux")),
    ]
}

fn module_candidates(
    root: &SystemRoot,
    osrelease: &str,
    stem: &str,
    extension: &str,
) -> [PathBuf; 3] {
    [
        root.path(&format!("/usr/lib/debug/lib/modules/{osrelease}/{stem}")),
        root.path(&format!("/usr/lib/debug/lib/modules/{osrelease}/{stem}.debug")),
        root.path(&format!("/lib/modules/{osrelease}/{stem}{extension}")),
    ]
}

/// Split a trailing `.gz`/`.xz` off a depmod path. The debug-file
/// candidates are searched without it; the module tree keeps it.
fn split_compression_suffix(path: &[u8]) -> (&[u8], &[u8]) {
    if path.len() >= 3 {
        let (stem, extension) = path.split_at(path.len() - 3);
        if extension == b".gz" || extension == b".xz" {
            return (stem, extension);
        }
    }
    (path, b"")
}

fn path_label(path: &Path) -> String {
    path.display().to_string()
}
