//! Import-address-table walker (C5).
//!
//! Locates the IAT slot backing a given `(DLL, function)` import inside the
//! currently-loaded module so it can be overwritten with a detour. This is
//! an alternative to prologue patching: instead of rewriting the target
//! function's machine code, only the pointer the loader already wrote into
//! our own import table is swapped, which is both smaller in surface area
//! and reversible by construction (restoring the original pointer undoes it
//! completely).
//!
//! Only PE32+ (64-bit) images are supported, matching the rest of this
//! crate's Windows side.

use std::ffi::{c_void, CStr};
use std::mem::size_of;

/// One resolved import: its declaring DLL and function name, plus a pointer
/// to the IAT slot (not the function itself) that the loader filled in.
pub struct Import {
    pub dll_name: String,
    pub function_name: String,
    pub slot: *mut usize,
}

const DOS_MAGIC: u16 = 0x5a4d;
const PE_MAGIC: u32 = 0x4550;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const MAX_DATA_DIRECTORIES: usize = 16;
const IMPORT_DIRECTORY_INDEX: usize = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ImportDirectoryEntry {
    import_lookup_table_rva: u32,
    timestamp: u32,
    forwarder_chain: u32,
    name_rva: u32,
    import_address_table_rva: u32,
}

/// Reads `T` from a raw process address. The caller must ensure `addr` is
/// valid and at least `size_of::<T>()` bytes are mapped and readable.
unsafe fn read_at<T: Copy>(addr: usize) -> T {
    std::ptr::read_unaligned(addr as *const T)
}

/// Walks every entry of the Import Directory Table of the module whose
/// headers are at `image_base` (the value the loader handed us, i.e. the
/// module's `HINSTANCE`/base address), calling `callback` once per
/// non-ordinal import. Reads headers straight out of the mapped image: no
/// file I/O, since by the time this runs the module is already loaded and
/// its RVAs are valid offsets from `image_base`.
///
/// # Safety
/// `image_base` must be the base address of a PE32+ image currently mapped
/// in this process (e.g. returned by `GetModuleHandleW`). Parsing a
/// malformed or non-PE32+ image is undefined behavior; this function trusts
/// the loader to have already validated the image before mapping it, and
/// only exists to re-derive offsets the loader computed internally but does
/// not expose.
pub unsafe fn for_each_import(image_base: usize, mut callback: impl FnMut(Import)) {
    let dos_magic: u16 = read_at(image_base);
    assert_eq!(dos_magic, DOS_MAGIC, "not a DOS/MZ image");

    let pe_offset: u32 = read_at(image_base + 0x3c);
    let pe_header_addr = image_base + pe_offset as usize;
    let pe_magic: u32 = read_at(pe_header_addr);
    assert_eq!(pe_magic, PE_MAGIC, "missing PE signature");

    let coff_header_addr = pe_header_addr + 4;
    // COFFHeader: Machine(2) NumberOfSections(2) TimeDateStamp(4)
    // PointerToSymbolTable(4) NumberOfSymbols(4) SizeOfOptionalHeader(2)
    // Characteristics(2) = 20 bytes.
    let size_of_optional_header: u16 = read_at(coff_header_addr + 16);
    assert!(
        size_of_optional_header >= 112,
        "only PE32+ images are supported"
    );

    let optional_header_addr = coff_header_addr + 20;
    let magic: u16 = read_at(optional_header_addr);
    assert_eq!(magic, PE32_PLUS_MAGIC, "only PE32+ images are supported");
    let number_of_rva_and_sizes: u32 = read_at(optional_header_addr + 108);
    assert!(number_of_rva_and_sizes as usize <= MAX_DATA_DIRECTORIES);

    let data_directories_addr = optional_header_addr + 112;
    let mut directories = [DataDirectory::default(); MAX_DATA_DIRECTORIES];
    for (i, dir) in directories
        .iter_mut()
        .enumerate()
        .take(number_of_rva_and_sizes as usize)
    {
        *dir = read_at(data_directories_addr + i * size_of::<DataDirectory>());
    }

    let import_directory = directories[IMPORT_DIRECTORY_INDEX];
    if import_directory.virtual_address == 0 {
        return;
    }

    let mut entry_addr = image_base + import_directory.virtual_address as usize;
    loop {
        let entry: ImportDirectoryEntry = read_at(entry_addr);
        if entry.import_lookup_table_rva == 0 {
            break;
        }
        debug_assert_eq!(entry.forwarder_chain, 0, "forwarder chains are not supported");

        let dll_name_addr = image_base + entry.name_rva as usize;
        let dll_name = CStr::from_ptr(dll_name_addr as *const i8)
            .to_string_lossy()
            .into_owned();

        let mut ilt_addr = image_base + entry.import_lookup_table_rva as usize;
        let iat_base = image_base + entry.import_address_table_rva as usize;
        loop {
            let ilt_entry: u64 = read_at(ilt_addr);
            if ilt_entry == 0 {
                break;
            }
            // High bit set means import-by-ordinal; those don't carry a
            // name and can't be resolved by this crate's lookup-by-name
            // interface, so they're skipped.
            if ilt_entry & (1u64 << 63) == 0 {
                // Name-table entry: a 2-byte hint followed by the
                // NUL-terminated name.
                let name_addr = image_base + ((ilt_entry & 0x7fff_ffff) as usize) + 2;
                let function_name = CStr::from_ptr(name_addr as *const i8)
                    .to_string_lossy()
                    .into_owned();

                let offset_into_ilt = ilt_addr - (image_base + entry.import_lookup_table_rva as usize);
                let slot = (iat_base + offset_into_ilt) as *mut usize;

                callback(Import {
                    dll_name: dll_name.clone(),
                    function_name,
                    slot,
                });
            }
            ilt_addr += 8;
        }

        entry_addr += size_of::<ImportDirectoryEntry>();
    }
}

/// Overwrites an IAT slot with `replacement`, returning the previous value
/// so it can be restored later. The write goes through `VirtualProtect` to
/// temporarily make the (normally read-only, post-relocation) IAT page
/// writable.
///
/// # Safety
/// `slot` must be a valid, writable-after-`VirtualProtect` pointer obtained
/// from [`for_each_import`] in the same process.
pub unsafe fn patch_slot(slot: *mut usize, replacement: usize) -> usize {
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};

    let mut old_protect = 0u32;
    VirtualProtect(
        slot as *const c_void,
        size_of::<usize>(),
        PAGE_EXECUTE_READWRITE,
        &mut old_protect,
    );
    let previous = std::ptr::read(slot);
    std::ptr::write(slot, replacement);
    VirtualProtect(slot as *const c_void, size_of::<usize>(), old_protect, &mut old_protect);
    previous
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `for_each_import` requires a real mapped PE32+ image and calls
    /// `patch_slot`'s sibling `VirtualProtect`, neither of which is
    /// meaningful off Windows; this module is exercised by
    /// [`crate::host::shim`]'s installation path instead. The constant
    /// layout assumptions are still worth pinning down directly, since a
    /// transposed offset here silently corrupts unrelated header fields.
    #[test]
    fn header_layout_offsets_match_the_pe32_plus_spec() {
        assert_eq!(DOS_MAGIC, 0x5a4d);
        assert_eq!(PE_MAGIC, 0x4550);
        assert_eq!(PE32_PLUS_MAGIC, 0x20b);
        assert_eq!(size_of::<ImportDirectoryEntry>(), 20);
        assert_eq!(size_of::<DataDirectory>(), 8);
    }
}
