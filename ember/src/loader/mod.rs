//! Program image loading and execution.
//!
//! An image is checked to be a well-formed 64-bit ELF, its loadable
//! segments get backing memory and page mappings built one by one, and
//! control moves to the entry point in one of two ways: dropping to user
//! privilege through a synthetic interrupt return (never comes back), or
//! calling the entry in place at kernel privilege (returns a status).
//!
//! Any failure along the way aborts the whole load and releases every
//! region acquired so far; nothing stays mapped after a failed attempt.

mod segment;

pub use segment::SegmentAllocation;

use crate::fs::FileSource;
use crate::mm::{MapFlags, PageMapper, PhysAllocator};
use alloc::vec::Vec;
use cinder::addressing::{Va, PAGE_SIZE};
use cinder::x86_64::exec::Transfer;
use core::convert::Infallible;
use num_enum::TryFromPrimitive;
use object::elf::FileHeader64;
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use segment::{Fill, Region};

/// Program-header entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SegmentKind {
    /// Unused entry.
    Null = 0,
    /// Mapped into the address space and populated from the file.
    Load = 1,
    /// Dynamic linking tables.
    Dynamic = 2,
    /// Interpreter path.
    Interp = 3,
    /// Auxiliary notes.
    Note = 4,
    /// Reserved.
    Shlib = 5,
    /// The program header table itself.
    Phdr = 6,
    /// Thread-local storage template.
    Tls = 7,
}

/// Virtual base of the user stack.
pub const USER_STACK_BASE: usize = 0x500000;
/// User stack span.
pub const USER_STACK_BYTES: usize = 2 * PAGE_SIZE;
// Initial user rsp sits a little below the top.
const USER_STACK_TOP: usize = USER_STACK_BASE + USER_STACK_BYTES - 64;

/// Why a load attempt was rejected or abandoned.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadError {
    /// The file does not exist or is empty.
    MissingOrEmpty,
    /// The content is not an ELF64 executable image.
    NotElf64,
    /// The image tables are self-inconsistent.
    BadImage,
    /// A needed virtual page is already mapped.
    PagesBusy,
    /// Physical memory ran out.
    OutOfMemory,
    /// The page mapper rejected a mapping.
    MapFailed,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadError::MissingOrEmpty => write!(f, "the file does not exist or is empty"),
            LoadError::NotElf64 => write!(f, "not an ELF file or not in ELF64 format"),
            LoadError::BadImage => write!(f, "malformed program image"),
            LoadError::PagesBusy => write!(f, "some pages are already mapped"),
            LoadError::OutOfMemory => write!(f, "cannot allocate memory, probably out of memory"),
            LoadError::MapFailed => write!(f, "mapping the pages failed"),
        }
    }
}

fn parse(image: &[u8]) -> Result<(&FileHeader64<Endianness>, Endianness), LoadError> {
    let header = FileHeader64::<Endianness>::parse(image).map_err(|_| LoadError::NotElf64)?;
    let endian = header.endian().map_err(|_| LoadError::NotElf64)?;
    Ok((header, endian))
}

/// Structural check: non-empty content with a well-formed 64-bit
/// executable header. Touches no memory beyond the image itself.
pub fn validate(image: &[u8]) -> Result<(), LoadError> {
    if image.is_empty() {
        return Err(LoadError::MissingOrEmpty);
    }
    parse(image).map(|_| ())
}

/// Fetch `name` from `source` and validate it as an executable image.
pub fn read_image<F: FileSource>(source: &F, name: &str) -> Result<Vec<u8>, LoadError> {
    let content = source.read_file(name);
    validate(&content)?;
    Ok(content)
}

/// An image whose loadable segments are in memory and mapped.
///
/// This is the state between materialization and the hand-off; it tracks
/// one record per program-header entry so a failed or returned execution
/// can release exactly what was acquired.
#[derive(Debug)]
pub struct Loaded {
    segments: Vec<SegmentAllocation>,
    entry: Va,
}

impl Loaded {
    /// The image's entry point.
    pub fn entry(&self) -> Va {
        self.entry
    }

    /// Records that still hold memory.
    pub fn live_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.is_live()).count()
    }

    /// Release every region this load acquired. Best effort: a failed
    /// unmap is reported and the sweep continues.
    pub fn release<P: PhysAllocator, M: PageMapper>(mut self, palloc: &P, mapper: &M) {
        for seg in &mut self.segments {
            seg.release(palloc, mapper);
        }
    }
}

/// Materialize every loadable segment of `image`, in header order.
///
/// The first conflict, allocation failure or mapping failure abandons the
/// attempt; everything materialized so far is released before the error
/// returns.
pub fn load_segments<P: PhysAllocator, M: PageMapper>(
    image: &[u8],
    palloc: &P,
    mapper: &M,
    flags: MapFlags,
) -> Result<Loaded, LoadError> {
    validate(image)?;
    let (header, endian) = parse(image)?;
    let entry = Va::new(header.e_entry(endian) as usize).ok_or(LoadError::NotElf64)?;
    let headers = header
        .program_headers(endian, image)
        .map_err(|_| LoadError::BadImage)?;

    let mut segments: Vec<SegmentAllocation> = Vec::with_capacity(headers.len());
    for ph in headers {
        if !matches!(
            SegmentKind::try_from(ph.p_type(endian)),
            Ok(SegmentKind::Load)
        ) {
            segments.push(SegmentAllocation::empty());
            continue;
        }

        let outcome = segment_bytes(ph, endian, image).and_then(|bytes| {
            segment::materialize(
                Region {
                    vaddr: ph.p_vaddr(endian) as usize,
                    mem_size: ph.p_memsz(endian) as usize,
                },
                Fill::Bytes(bytes),
                palloc,
                mapper,
                flags,
            )
        });

        match outcome {
            Ok(seg) => segments.push(seg),
            Err(err) => {
                warning!("load aborted: {}", err);
                for seg in &mut segments {
                    seg.release(palloc, mapper);
                }
                return Err(err);
            }
        }
    }

    Ok(Loaded { segments, entry })
}

// File-backed bytes of a loadable entry. The copy stops at the file size;
// the zone up to the memory size keeps allocator-provided content.
fn segment_bytes<'a>(
    ph: &object::elf::ProgramHeader64<Endianness>,
    endian: Endianness,
    image: &'a [u8],
) -> Result<&'a [u8], LoadError> {
    if ph.p_filesz(endian) > ph.p_memsz(endian) {
        return Err(LoadError::BadImage);
    }
    ph.data(endian, image).map_err(|_| LoadError::BadImage)
}

/// Load `image` and drop to user privilege at its entry point.
///
/// Segments and a fixed two-page stack are mapped user-accessible, the
/// current kernel stack is recorded for interrupt entry, then the switch
/// happens. On success nothing ever comes back here, so the regions stay
/// live for good: there is no path that reclaims them after the program
/// exits. Only the failure side returns.
pub fn exec<P: PhysAllocator, M: PageMapper, T: Transfer>(
    image: &[u8],
    palloc: &P,
    mapper: &M,
    hw: &T,
) -> Result<Infallible, LoadError> {
    let loaded = load_segments(
        image,
        palloc,
        mapper,
        MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER,
    )?;

    // The stack is its own region with its own lifetime, zero-filled
    // rather than copied.
    let stack = segment::materialize(
        Region {
            vaddr: USER_STACK_BASE,
            mem_size: USER_STACK_BYTES,
        },
        Fill::Zero,
        palloc,
        mapper,
        MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER,
    );
    let _stack = match stack {
        Ok(stack) => stack,
        Err(err) => {
            warning!("unable to build a stack for the program");
            loaded.release(palloc, mapper);
            return Err(err);
        }
    };

    let entry = loaded.entry();
    hw.set_kernel_stack();
    hw.enter_user(entry, Va::new(USER_STACK_TOP).unwrap())
}

/// Load `image` and call its entry point in place, at kernel privilege.
///
/// The segments are mapped without user access, the entry runs as an
/// ordinary procedure, and whatever it returns is passed along after all
/// regions are released.
pub fn exec_in_place<P: PhysAllocator, M: PageMapper, T: Transfer>(
    image: &[u8],
    palloc: &P,
    mapper: &M,
    hw: &T,
) -> Result<i64, LoadError> {
    let loaded = load_segments(image, palloc, mapper, MapFlags::PRESENT | MapFlags::WRITE)?;

    let status = unsafe { hw.call(loaded.entry()) };

    loaded.release(palloc, mapper);
    Ok(status)
}

#[cfg(test)]
mod tests;
