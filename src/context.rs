use crate::{*, error::*, log::*, settings::*, procfs::*, target::*, variables::*, value::*, eval::*, format::*};
use std::collections::HashMap;

// Everything one debug session needs to re-evaluate watches, and the only thing the evaluator talks to.
//
// Usage, on every target stop:
//   ctx.on_stop();
//   ctx.begin_cycle();
//   ... evaluate all watches: ingest(), read_value(), format_printf(), ...
//
// Nothing here fails the whole pass: each operation returns None/false for its own bad input or unreadable memory and
// leaves an explanation in `log`.
pub struct Context<T: Target> {
    pub settings: Settings,
    pub reader: TargetReader<T>,
    pub variables: VariableStore,
    pub eval: EvalCache,
    pub log: Log,

    // Enumerand names per enum type, and which type each variable has, for %E.
    enums: EnumTables,
}

#[derive(Default)]
pub struct EnumTables {
    tables: HashMap<String, HashMap<i128, String>>,
    variable_types: HashMap<String, String>,
}

impl EnumTables {
    pub fn name_of(&self, variable: &str, value: i128) -> Option<String> {
        let ty = self.variable_types.get(variable)?;
        self.tables.get(ty)?.get(&value).cloned()
    }
}

fn logged<X>(log: &mut Log, r: Result<X>, what: impl FnOnce() -> String) -> Option<X> {
    match r {
        Ok(x) => Some(x),
        Err(e) => {
            log!(log, "{}: {}", what(), e);
            None
        }
    }
}

impl<T: Target> Context<T> {
    pub fn new(target: T, settings: Settings) -> Self {
        let reader = TargetReader::new(target, &settings);
        let eval = EvalCache::new(&settings);
        Self {settings, reader, variables: VariableStore::new(), eval, log: Log::new(), enums: EnumTables::default()}
    }

    pub fn target(&mut self) -> &mut T { &mut self.reader.target }

    // Cycle boundary: forget last cycle's non-const variables and cached bytes, prefetch last cycle's footprint,
    // reset per-pass model caches. Returns the number of ranges prefetched.
    pub fn begin_cycle(&mut self) -> usize {
        self.variables.clear_non_const();
        let fetched = self.reader.begin_update_cycle();
        self.eval.begin_pass();
        fetched
    }

    pub fn on_continue(&mut self) { self.reader.on_continue(); }
    pub fn on_stop(&mut self) { self.reader.on_stop(); }
    pub fn is_stopped(&self) -> bool { self.reader.is_stopped() }

    // Reads `size` bytes of target memory and stores them into the variable. With offset == APPEND, `address` is
    // remembered as the new element's origin.
    pub fn ingest(&mut self, name: &str, address: i64, size: i64, offset: i64, virtual_size: Option<usize>, is_const: bool) -> bool {
        let bytes = match logged(&mut self.log, self.reader.read_memory(address, size), || format!("{} @0x{:x}", name, address)) {
            Some(b) => b,
            None => return false,
        };
        let r = self.variables.set_variable(name, bytes.len(), &InputValue::Bytes(bytes), offset, Some(address as usize), virtual_size, is_const);
        logged(&mut self.log, r, || format!("{}", name)).is_some()
    }

    pub fn read_memory(&mut self, address: i64, size: i64) -> Option<Vec<u8>> {
        let r = self.reader.read_memory(address, size);
        logged(&mut self.log, r, || format!("read @0x{:x}:{}", address, size))
    }

    pub fn read_memory_batch<K: Clone>(&mut self, requests: &[BatchRequest<K>]) -> Vec<(K, Option<Vec<u8>>)> {
        let res = self.reader.read_memory_batch(requests);
        let log = &mut self.log;
        res.into_iter().zip(requests).map(|((k, r), req)| (k, logged(log, r, || format!("read @0x{:x}:{}", req.address, req.size)))).collect()
    }

    pub fn set_variable(&mut self, name: &str, size: usize, value: &InputValue, offset: i64, target_base: Option<usize>, virtual_size: Option<usize>, is_const: bool) -> bool {
        let r = self.variables.set_variable(name, size, value, offset, target_base, virtual_size, is_const);
        logged(&mut self.log, r, || format!("{}", name)).is_some()
    }

    pub fn read_value(&mut self, r: &Ref) -> Option<DecodedValue> {
        logged(&mut self.log, self.variables.read_value(r), || format!("{}+{}", r.name, r.offset))
    }

    pub fn write_value(&mut self, r: &Ref, value: &InputValue, virtual_size: Option<usize>) -> bool {
        let res = self.variables.write_value(r, value, virtual_size);
        logged(&mut self.log, res, || format!("{}+{}", r.name, r.offset)).is_some()
    }

    pub fn read_raw(&mut self, r: &Ref, size: usize) -> Option<Vec<u8>> {
        logged(&mut self.log, self.variables.read_raw(r, size), || format!("{}+{}", r.name, r.offset))
    }

    pub fn element_count(&self, name: &str) -> usize { self.variables.get_array_element_count(name) }
    pub fn element_target_base(&self, name: &str, index: usize) -> Option<usize> { self.variables.get_element_target_base(name, index) }

    pub fn symbol_address(&mut self, name: &str) -> Option<usize> {
        let r = self.reader.symbol_address(name);
        logged(&mut self.log, r, || format!("address of {}", name))
    }

    pub fn symbol_size(&mut self, name: &str) -> Option<usize> {
        let r = self.reader.symbol_size(name);
        logged(&mut self.log, r, || format!("size of {}", name))
    }

    pub fn symbol_array_count(&mut self, name: &str) -> Option<usize> {
        let r = self.reader.symbol_array_count(name);
        logged(&mut self.log, r, || format!("array count of {}", name))
    }

    pub fn read_register(&mut self, name: &str) -> Option<u64> {
        let r = self.reader.read_register(name);
        logged(&mut self.log, r, || format!("register {}", name))
    }

    // Replaces the enumerands of `type_name`; variables already bound to it see the new table.
    pub fn register_enum(&mut self, type_name: &str, enumerands: &[(i128, &str)]) {
        self.enums.tables.insert(type_name.to_string(), enumerands.iter().map(|(v, s)| (*v, s.to_string())).collect());
    }

    pub fn set_enum_type(&mut self, variable: &str, type_name: &str) {
        self.enums.variable_types.insert(variable.to_string(), type_name.to_string());
    }

    pub fn format_printf(&mut self, spec: &str, value: &DecodedValue, r: &Ref) -> String {
        let mut env = SessionEnv {reader: &mut self.reader, enums: &self.enums};
        self.eval.format_printf(spec, value, r, &mut env, &self.settings)
    }

    pub fn format_template(&mut self, fmt: &str, values: &[(DecodedValue, Ref)]) -> String {
        let mut env = SessionEnv {reader: &mut self.reader, enums: &self.enums};
        format::format_template(fmt, values, &mut env, &self.settings)
    }

    pub fn invalidate(&mut self, address: i64, size: i64) -> bool {
        match logged(&mut self.log, normalize_span(address, size), || format!("invalidate @0x{:x}:{}", address, size)) {
            Some((a, n)) => {
                self.reader.invalidate(a, n);
                true
            }
            None => false,
        }
    }

    pub fn invalidate_all(&mut self) { self.reader.invalidate_all(); }
    pub fn forget_symbols(&mut self) { self.reader.forget_symbols(); }
}

struct SessionEnv<'a, T: Target> {
    reader: &'a mut TargetReader<T>,
    enums: &'a EnumTables,
}

impl<'a, T: Target> FormatEnv for SessionEnv<'a, T> {
    fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> { self.reader.symbol_at(addr) }

    fn enum_name(&mut self, r: &Ref, value: i128) -> Option<String> {
        self.enums.name_of(&r.name, value)
    }

    fn read_string(&mut self, addr: usize, unit: usize, limit: usize) -> Result<(Vec<u8>, bool)> {
        self.reader.read_null_terminated(addr, unit, limit)
    }

    fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> { self.reader.read(addr, size) }
}
