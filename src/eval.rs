use crate::{*, error::*, model::*, value::*, format::*, settings::*};
use std::collections::HashMap;

// Memoization for the expression evaluator.
//
// Model lookups are cached for one evaluation pass: the model can change between passes (e.g. a watch was edited),
// but never during one. begin_pass() must be called before each pass; nothing here expires on its own.
//
// Formatted strings are cached across passes, since formatting is a pure function of (specifier, value, type),
// except for specifiers that look at the target (symbols, strings behind pointers, enum tables). Those are never cached.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NumericKey {
    Int(i128),
    // Bits, so that NaN can be a key and -0.0 differs from 0.0.
    Float(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FormatKey {
    Numeric {spec: Specifier, value: NumericKey, kind: Option<ScalarKind>, bits: u32},
    Text {spec: Specifier, text: String},
    // Blobs are interpreted according to the ref's width and bit width (integers, network addresses), so those are part of the key.
    Bytes {spec: Specifier, bytes: Vec<u8>, width: i64, bits: u32},
}

impl FormatKey {
    pub fn new(spec: Specifier, value: &DecodedValue, r: &Ref) -> Option<FormatKey> {
        if spec.is_address_dependent() {
            return None;
        }
        let numeric = |v| FormatKey::Numeric {spec, value: v, kind: r.kind, bits: r.bit_width()};
        Some(match value {
            DecodedValue::Int(x) => numeric(NumericKey::Int(*x as i128)),
            DecodedValue::Wide(x) => numeric(NumericKey::Int(*x)),
            DecodedValue::Float(f) => numeric(NumericKey::Float(f.to_bits())),
            DecodedValue::Text(s) => FormatKey::Text {spec, text: s.clone()},
            DecodedValue::Bytes(b) => FormatKey::Bytes {spec, bytes: b.clone(), width: r.width, bits: r.bit_width()},
        })
    }
}

#[derive(Default, Clone, Debug)]
pub struct EvalStats {
    pub passes: usize,
    pub model_hits: usize,
    pub model_misses: usize,
    pub format_hits: usize,
    pub format_misses: usize,
    pub format_uncached: usize,
}

pub struct EvalCache {
    symbol_refs: HashMap<(NodeId, String), NodeId>,
    member_refs: HashMap<(NodeId, String), NodeId>,
    byte_widths: HashMap<NodeId, usize>,
    member_offsets: HashMap<NodeId, usize>,

    formatted: HashMap<FormatKey, String>,
    format_capacity: usize,

    pub stats: EvalStats,
}

impl EvalCache {
    pub fn new(settings: &Settings) -> Self {
        Self {symbol_refs: HashMap::new(), member_refs: HashMap::new(), byte_widths: HashMap::new(), member_offsets: HashMap::new(),
              formatted: HashMap::new(), format_capacity: settings.format_cache_capacity, stats: EvalStats::default()}
    }

    pub fn begin_pass(&mut self) {
        self.symbol_refs.clear();
        self.member_refs.clear();
        self.byte_widths.clear();
        self.member_offsets.clear();
        self.stats.passes += 1;
    }

    // Failures aren't cached; asking again in the same pass asks the model again.

    pub fn resolve_symbol(&mut self, model: &dyn ModelInfo, base: NodeId, name: &str) -> Result<NodeId> {
        let key = (base, name.to_string());
        if let Some(&id) = self.symbol_refs.get(&key) {
            self.stats.model_hits += 1;
            return Ok(id);
        }
        self.stats.model_misses += 1;
        let id = model.resolve_symbol(base, name)?;
        self.symbol_refs.insert(key, id);
        Ok(id)
    }

    pub fn resolve_member(&mut self, model: &dyn ModelInfo, base: NodeId, name: &str) -> Result<NodeId> {
        let key = (base, name.to_string());
        if let Some(&id) = self.member_refs.get(&key) {
            self.stats.model_hits += 1;
            return Ok(id);
        }
        self.stats.model_misses += 1;
        let id = model.resolve_member(base, name)?;
        self.member_refs.insert(key, id);
        Ok(id)
    }

    pub fn byte_width(&mut self, model: &dyn ModelInfo, node: NodeId) -> Result<usize> {
        if let Some(&w) = self.byte_widths.get(&node) {
            self.stats.model_hits += 1;
            return Ok(w);
        }
        self.stats.model_misses += 1;
        let w = model.byte_width(node)?;
        self.byte_widths.insert(node, w);
        Ok(w)
    }

    pub fn member_offset(&mut self, model: &dyn ModelInfo, node: NodeId) -> Result<usize> {
        if let Some(&o) = self.member_offsets.get(&node) {
            self.stats.model_hits += 1;
            return Ok(o);
        }
        self.stats.model_misses += 1;
        let o = model.member_offset(node)?;
        self.member_offsets.insert(node, o);
        Ok(o)
    }

    // Typed reference to a member of `node`'s value, where `base` is a reference to that value.
    pub fn member_ref(&mut self, model: &dyn ModelInfo, base: &Ref, node: NodeId, name: &str) -> Result<(NodeId, Ref)> {
        let member = self.resolve_member(model, node, name)?;
        let offset = self.member_offset(model, member)?;
        let width = self.byte_width(model, member)?;
        let offset = match base.offset.checked_add(i64::try_from(offset)?) {
            Some(o) => o,
            None => return err!(Usage, "offset of {}.{} overflows", base.name, name),
        };
        let mut r = Ref::new(&base.name, offset, i64::try_from(width)?);
        if let Some((kind, bits)) = model.scalar_type(member)? {
            r.kind = Some(kind);
            r.bits = Some(bits);
        }
        Ok((member, r))
    }

    pub fn format_printf(&mut self, spec: &str, value: &DecodedValue, r: &Ref, env: &mut dyn FormatEnv, settings: &Settings) -> String {
        let s = match Specifier::parse(spec) {
            Some(s) => s,
            None => return format!("<unknown specifier {}>", spec),
        };
        let key = match FormatKey::new(s, value, r) {
            Some(k) => k,
            None => {
                self.stats.format_uncached += 1;
                return format_value(s, value, r, env, settings);
            }
        };
        if let Some(out) = self.formatted.get(&key) {
            self.stats.format_hits += 1;
            return out.clone();
        }
        self.stats.format_misses += 1;
        let out = format_value(s, value, r, env, settings);
        if self.formatted.len() >= self.format_capacity {
            self.formatted.clear();
        }
        self.formatted.insert(key, out.clone());
        out
    }

    pub fn formatted_len(&self) -> usize { self.formatted.len() }
    pub fn clear_formatted(&mut self) { self.formatted.clear(); }
}

#[cfg(test)]
mod tests {
    use crate::{*, eval::*, model::*, value::*, format::*, settings::*, procfs::*, error::*};

    fn list_model() -> (ModelTree, NodeId) {
        let mut m = ModelTree::new();
        let root = m.root();
        let node = m.add_struct(root, "node", 0, 9).unwrap();
        m.add_scalar(node, "value", 0, 1, ScalarKind::Signed).unwrap();
        m.add(node, ModelNode {name: "next".to_string(), offset: 1, is_pointer: true, ..Default::default()}).unwrap();
        (m, node)
    }

    #[test]
    fn model_lookups_are_per_pass() {
        let (m, node) = list_model();
        let mut c = EvalCache::new(&Settings::default());
        c.begin_pass();
        for _ in 0..5 {
            assert_eq!(c.resolve_symbol(&m, m.root(), "node").unwrap(), node);
            let (_, r) = c.member_ref(&m, &Ref::new("list", 18, 9), node, "next").unwrap();
            assert_eq!(r, Ref::typed("list", 19, 8, ScalarKind::Unsigned).with_bits(64));
        }
        assert_eq!(m.queries(), QueryCounts {symbol: 1, member: 1, byte_width: 1, member_offset: 1});

        c.begin_pass();
        c.resolve_symbol(&m, m.root(), "node").unwrap();
        assert_eq!(m.queries().symbol, 2);

        assert!(c.resolve_member(&m, node, "prev").is_err());
        assert!(c.resolve_member(&m, node, "prev").is_err());
        assert_eq!(m.queries().member, 3);
    }

    struct CountingEnv(usize);

    impl FormatEnv for CountingEnv {
        fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> {
            self.0 += 1;
            Ok(SymbolInfo {name: format!("sym{}", self.0), offset: 0, source: None})
        }
        fn enum_name(&mut self, r: &Ref, value: i128) -> Option<String> { None }
        fn read_string(&mut self, addr: usize, unit: usize, limit: usize) -> Result<(Vec<u8>, bool)> { err!(Fetch, "") }
        fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> { err!(Fetch, "") }
    }

    #[test]
    fn formatted_strings() {
        let settings = Settings::default();
        let mut c = EvalCache::new(&settings);
        let mut env = CountingEnv(0);
        let r = Ref::new("x", 0, 4);
        assert_eq!(c.format_printf("%x", &DecodedValue::Int(26), &r, &mut env, &settings), "0x0000001a");
        assert_eq!(c.format_printf("%x", &DecodedValue::Int(26), &r, &mut env, &settings), "0x0000001a");
        assert_eq!(c.format_printf("%x", &DecodedValue::Int(26), &Ref::new("x", 0, 2), &mut env, &settings), "0x001a");
        assert_eq!((c.stats.format_hits, c.stats.format_misses), (1, 2));

        // Symbol at an address can change while the value stays the same.
        assert_eq!(c.format_printf("%ps", &DecodedValue::Wide(0x1000), &r, &mut env, &settings), "sym1");
        assert_eq!(c.format_printf("%ps", &DecodedValue::Wide(0x1000), &r, &mut env, &settings), "sym2");
        assert_eq!(c.stats.format_uncached, 2);

        assert_eq!(c.format_printf("%k", &DecodedValue::Int(1), &r, &mut env, &settings), "<unknown specifier %k>");
        assert_eq!(c.formatted_len(), 2);
    }

    #[test]
    fn capacity() {
        let mut settings = Settings::default();
        settings.format_cache_capacity = 3;
        let mut c = EvalCache::new(&settings);
        let r = Ref::new("x", 0, 4);
        for i in 0..10 {
            c.format_printf("%d", &DecodedValue::Int(i), &r, &mut NoTarget, &settings);
            assert!(c.formatted_len() <= 3);
        }
        assert_eq!(c.format_printf("%v", &DecodedValue::Float(f64::NAN), &r, &mut NoTarget, &settings), "NaN");
        assert_eq!(c.format_printf("%v", &DecodedValue::Float(f64::NAN), &r, &mut NoTarget, &settings), "NaN");
        assert_eq!(c.stats.format_hits, 1);
    }
}
