use crate::{*, error::*, range_cache::*};
use libc::{pid_t, c_void};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    // Of the looked up address from the start of the symbol.
    pub offset: usize,
    // File:line, if the target knows it.
    pub source: Option<String>,
}

// Everything we need from the debugged target. Implemented by the host; all calls are synchronous.
// read_memory() must return exactly `size` bytes on success, and reading the same range twice without the target running
// in between must return the same bytes.
pub trait Target {
    fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>>;
    fn symbol_address(&mut self, name: &str) -> Result<usize>;
    fn symbol_size(&mut self, name: &str) -> Result<usize>;
    fn read_register(&mut self, name: &str) -> Result<u64>;

    fn symbol_array_count(&mut self, name: &str) -> Result<usize> {
        err!(NotImplemented, "array count of '{}' is not available", name)
    }

    // Name of the symbol containing the address, for %ps/%pS.
    fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> {
        err!(NoSymbol, "no symbol at 0x{:x}", addr)
    }
}

// Concrete transports. A host that debugs a local process can use ProcessTarget; a host that captured target memory earlier
// (a snapshot, like a core dump) can evaluate watches against it with SnapshotTarget.

struct SymbolEntry {
    name: String,
    addr: usize,
    size: usize,
    array_count: Option<usize>,
    source: Option<String>,
}

// We don't read debug info; the host registers the symbols it knows about.
pub struct SymbolTable {
    // Sorted by addr.
    entries: Vec<SymbolEntry>,
    by_name: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self { Self {entries: Vec::new(), by_name: HashMap::new()} }

    pub fn add(&mut self, name: &str, addr: usize, size: usize, array_count: Option<usize>, source: Option<&str>) {
        let idx = self.entries.partition_point(|e| e.addr <= addr);
        self.entries.insert(idx, SymbolEntry {name: name.to_string(), addr, size, array_count, source: source.map(|s| s.to_string())});
        self.by_name.clear();
        for (i, e) in self.entries.iter().enumerate() {
            self.by_name.insert(e.name.clone(), i);
        }
    }

    fn get(&self, name: &str) -> Result<&SymbolEntry> {
        match self.by_name.get(name) {
            Some(&i) => Ok(&self.entries[i]),
            None => err!(NoSymbol, "no symbol '{}'", name),
        }
    }

    pub fn address(&self, name: &str) -> Result<usize> { Ok(self.get(name)?.addr) }
    pub fn size(&self, name: &str) -> Result<usize> { Ok(self.get(name)?.size) }

    pub fn array_count(&self, name: &str) -> Result<usize> {
        match self.get(name)?.array_count {
            Some(n) => Ok(n),
            None => err!(TypeMismatch, "'{}' is not an array", name),
        }
    }

    // Symbol containing addr. Zero-size symbols match only their exact address.
    pub fn find(&self, addr: usize) -> Result<SymbolInfo> {
        let mut idx = self.entries.partition_point(|e| e.addr <= addr);
        while idx > 0 {
            idx -= 1;
            let e = &self.entries[idx];
            if addr < e.addr + e.size.max(1) {
                return Ok(SymbolInfo {name: e.name.clone(), offset: addr - e.addr, source: e.source.clone()});
            }
            if e.size != 0 {
                break;
            }
        }
        err!(NoSymbol, "no symbol at 0x{:x}", addr)
    }
}

// Reads memory of a live process on this machine using process_vm_readv. Doesn't need to be attached with ptrace,
// but needs the same permissions as ptrace attach would. Registers aren't available this way.
pub struct ProcessTarget {
    pid: pid_t,
    pub symbols: SymbolTable,
}

impl ProcessTarget {
    pub fn new(pid: pid_t) -> Self { Self {pid, symbols: SymbolTable::new()} }
    pub fn current_process() -> Self { Self::new(unsafe {libc::getpid()}) }

    pub fn pid(&self) -> pid_t { self.pid }
}

impl Target for ProcessTarget {
    fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        if size == 0 {
            return Ok(buf);
        }
        unsafe {
            let local_iov = libc::iovec {iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: size};
            let remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: size};
            let r = libc::process_vm_readv(self.pid, &local_iov as *const libc::iovec, 1, &remote_iov as *const libc::iovec, 1, 0);
            if r < 0 {
                if *libc::__errno_location() == libc::EFAULT {
                    return err!(Fetch, "bad address 0x{:x}", addr); // shorter message for the common case, e.g. null pointer in a watch
                }
                return errno_err!("process_vm_readv failed");
            }
            if r != size as isize {
                return err!(Fetch, "unexpected EOF in mem @{:x}:0x{:x}", addr, size);
            }
        }
        Ok(buf)
    }

    fn symbol_address(&mut self, name: &str) -> Result<usize> { self.symbols.address(name) }
    fn symbol_size(&mut self, name: &str) -> Result<usize> { self.symbols.size(name) }
    fn symbol_array_count(&mut self, name: &str) -> Result<usize> { self.symbols.array_count(name) }
    fn read_register(&mut self, name: &str) -> Result<u64> { err!(NotImplemented, "register {} is not available without ptrace", name) }
    fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> { self.symbols.find(addr) }
}

// Target memory captured earlier: a set of mapped regions plus registers and symbols.
// Reads touching unmapped bytes fail, like they would on a live target.
pub struct SnapshotTarget {
    regions: ByteRangeCache, // same sorted segment store as the read cache, used as plain storage
    pub registers: HashMap<String, u64>,
    pub symbols: SymbolTable,

    // Every read_memory() call, for diagnostics.
    pub reads: Vec<(usize, usize)>,
}

impl SnapshotTarget {
    pub fn new() -> Self { Self {regions: ByteRangeCache::new(), registers: HashMap::new(), symbols: SymbolTable::new(), reads: Vec::new()} }

    // Overwrites whatever was mapped there; adjacent regions merge.
    pub fn map(&mut self, addr: usize, bytes: &[u8]) { self.regions.write(addr, bytes); }
    pub fn unmap(&mut self, addr: usize, size: usize) { self.regions.invalidate(addr, size); }
    pub fn unmap_all(&mut self) { self.regions.clear(); }
}

impl Target for SnapshotTarget {
    fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> {
        self.reads.push((addr, size));
        match self.regions.read(addr, size) {
            Some(b) => Ok(b.to_vec()),
            None => err!(Fetch, "bad address 0x{:x}:{}", addr, size),
        }
    }

    fn symbol_address(&mut self, name: &str) -> Result<usize> { self.symbols.address(name) }
    fn symbol_size(&mut self, name: &str) -> Result<usize> { self.symbols.size(name) }
    fn symbol_array_count(&mut self, name: &str) -> Result<usize> { self.symbols.array_count(name) }

    fn read_register(&mut self, name: &str) -> Result<u64> {
        match self.registers.get(&name.to_ascii_lowercase()) {
            Some(&v) => Ok(v),
            None => err!(NoSymbol, "no register {}", name),
        }
    }

    fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> { self.symbols.find(addr) }
}

#[cfg(test)]
mod tests {
    use crate::procfs::*;

    #[test]
    fn snapshot_reads() {
        let mut t = SnapshotTarget::new();
        t.map(0x1000, &[1, 2, 3, 4]);
        t.map(0x1004, &[5, 6]);
        assert_eq!(t.read_memory(0x1002, 4).unwrap(), vec![3, 4, 5, 6]);
        assert!(t.read_memory(0x1004, 3).unwrap_err().is_fetch());
        t.unmap(0x1001, 1);
        assert!(t.read_memory(0x1000, 2).is_err());
        assert_eq!(t.reads.len(), 3);

        t.registers.insert("rip".to_string(), 0x401000);
        assert_eq!(t.read_register("RIP").unwrap(), 0x401000);
        assert!(t.read_register("rax").is_err());
    }

    #[test]
    fn symbol_table() {
        let mut s = SymbolTable::new();
        s.add("counter", 0x2000, 4, None, None);
        s.add("nodes", 0x1000, 90, Some(10), Some("list.c:12"));
        s.add("marker", 0x3000, 0, None, None);
        assert_eq!(s.address("nodes").unwrap(), 0x1000);
        assert_eq!(s.array_count("nodes").unwrap(), 10);
        assert!(s.array_count("counter").is_err());
        assert!(s.address("missing").unwrap_err().is_no_symbol());
        assert_eq!(s.find(0x1009).unwrap(), SymbolInfo {name: "nodes".to_string(), offset: 9, source: Some("list.c:12".to_string())});
        assert_eq!(s.find(0x2003).unwrap().name, "counter");
        assert!(s.find(0x2004).is_err());
        assert_eq!(s.find(0x3000).unwrap().name, "marker");
        assert!(s.find(0x3001).is_err());
    }

    #[test]
    fn own_process_memory() {
        let data: Vec<u8> = (0..64u8).collect();
        let mut t = ProcessTarget::current_process();
        match t.read_memory(data.as_ptr() as usize + 3, 10) {
            Ok(bytes) => assert_eq!(bytes, (3..13u8).collect::<Vec<u8>>()),
            // Some sandboxes forbid process_vm_readv altogether.
            Err(e) if e.is_io_permission_denied() || e.code().is_none() => return,
            Err(e) => panic!("{:?}", e),
        }
        assert!(t.read_memory(0, 8).is_err());
    }
}
