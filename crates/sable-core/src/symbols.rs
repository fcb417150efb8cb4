//! Symbol tables
//!
//! Function, method, field, and variable symbols plus tag types, tag
//! literals, and the struct (object shape) table. Every dispatch-facing
//! table pairs a signature hashmap with a per-entry MRU cache: the cache
//! remembers the last successful `(type id, …)` pair so the repeated-shape
//! path skips the hashmap probe, and is updated on every fallback hit.

use rustc_hash::FxHashMap;

use crate::native::{NativeFn, NativeObjFn, NativeObjFn2};
use crate::object::{type_id, HeapObject};
use crate::value::Value;

/// Sentinel for "no type cached yet" in MRU slots
const MRU_EMPTY: u32 = u32::MAX;

/// Predefined error tag literal ids
///
/// Registered in this order by [`Symbols::new`], so the ids are stable.
pub mod error_sym {
    /// Callee arity did not match the call site
    pub const INVALID_SIGNATURE: u32 = 0;
    /// Field not present on the receiver's shape
    pub const FIELD_MISSING: u32 = 1;
    /// Index outside a container's bounds
    pub const OUT_OF_BOUNDS: u32 = 2;
    /// Lookup found nothing
    pub const NOT_FOUND: u32 = 3;
}

/// A function symbol entry
#[derive(Debug, Clone, Copy)]
pub enum FuncSymbol {
    /// Unassigned
    None,
    /// Host function
    Native {
        /// The function
        func: NativeFn,
        /// Declared parameter count
        num_params: u8,
    },
    /// Bytecode function
    Func {
        /// Entry pc
        pc: u32,
        /// Declared parameter count
        num_params: u8,
        /// Total frame slots past the header
        num_locals: u8,
    },
    /// A closure value bound as a function symbol; retained by the VM
    Closure(*mut HeapObject),
}

/// A method table entry
#[derive(Debug, Clone, Copy)]
pub enum MethodEntry {
    /// Bytecode method
    Func {
        /// Entry pc
        pc: u32,
        /// Declared parameter count, excluding the receiver
        num_params: u8,
        /// Total frame slots past the header
        num_locals: u8,
    },
    /// Host method returning one value
    Native1(NativeObjFn),
    /// Host method returning two values
    Native2(NativeObjFn2),
}

/// A method symbol with its MRU dispatch cache
#[derive(Debug, Clone, Copy)]
pub struct MethodSymbol {
    /// Method name
    pub name: u32,
    mru_type: u32,
    mru_entry: Option<MethodEntry>,
}

/// A field symbol with its MRU offset cache
#[derive(Debug, Clone, Copy)]
pub struct FieldSymbol {
    /// Field name
    pub name: u32,
    mru_type: u32,
    mru_offset: u16,
}

/// A tag type (user enum type)
#[derive(Debug, Clone, Copy)]
pub struct TagType {
    /// Type name
    pub name: u32,
    /// Member count
    pub num_members: u8,
}

/// A user object shape
#[derive(Debug, Clone)]
pub struct ObjectShape {
    /// Shape name
    pub name: u32,
    /// Field count
    pub num_fields: u16,
}

/// All symbol tables of one runtime instance
#[derive(Debug, Default)]
pub struct Symbols {
    names: Vec<String>,
    name_map: FxHashMap<String, u32>,

    /// Function symbols by id
    pub func_syms: Vec<FuncSymbol>,
    func_sig_map: FxHashMap<(u32, u32, u8), u32>,

    /// Global variable cells by id
    pub var_syms: Vec<Value>,
    var_sig_map: FxHashMap<(u32, u32), u32>,

    method_syms: Vec<MethodSymbol>,
    method_sig_map: FxHashMap<String, u32>,
    method_table: FxHashMap<(u32, u32), MethodEntry>,

    field_syms: Vec<FieldSymbol>,
    field_sig_map: FxHashMap<String, u32>,
    field_table: FxHashMap<(u32, u32), u16>,

    tag_types: Vec<TagType>,
    tag_lits: Vec<u32>,
    tag_lit_map: FxHashMap<String, u32>,

    object_shapes: Vec<ObjectShape>,
}

impl Symbols {
    /// Create the tables with the predefined error tag literals registered
    pub fn new() -> Self {
        let mut s = Self::default();
        assert_eq!(s.ensure_tag_literal("InvalidSignature"), error_sym::INVALID_SIGNATURE);
        assert_eq!(s.ensure_tag_literal("FieldMissing"), error_sym::FIELD_MISSING);
        assert_eq!(s.ensure_tag_literal("OutOfBounds"), error_sym::OUT_OF_BOUNDS);
        assert_eq!(s.ensure_tag_literal("NotFound"), error_sym::NOT_FOUND);
        s
    }

    /// Intern a name, returning its id
    pub fn ensure_name(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.name_map.get(name) {
            return id;
        }
        self.names.push(name.to_string());
        let id = (self.names.len() - 1) as u32;
        self.name_map.insert(name.to_string(), id);
        id
    }

    /// Resolve a name id back to its text
    pub fn name(&self, id: u32) -> &str {
        &self.names[id as usize]
    }

    // ===== Function symbols =====

    /// Get or create the function symbol for
    /// (resolved parent, name, parameter count)
    pub fn ensure_func_sym(&mut self, parent: u32, name: &str, num_params: u8) -> u32 {
        let name_id = self.ensure_name(name);
        if let Some(&id) = self.func_sig_map.get(&(parent, name_id, num_params)) {
            return id;
        }
        self.func_syms.push(FuncSymbol::None);
        let id = (self.func_syms.len() - 1) as u32;
        self.func_sig_map.insert((parent, name_id, num_params), id);
        id
    }

    // ===== Variable symbols =====

    /// Get or create the variable symbol for (resolved parent, name)
    pub fn ensure_var_sym(&mut self, parent: u32, name: &str) -> u32 {
        let name_id = self.ensure_name(name);
        if let Some(&id) = self.var_sig_map.get(&(parent, name_id)) {
            return id;
        }
        self.var_syms.push(Value::none());
        let id = (self.var_syms.len() - 1) as u32;
        self.var_sig_map.insert((parent, name_id), id);
        id
    }

    // ===== Method symbols =====

    /// Get or create a method symbol by name
    pub fn ensure_method_sym(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.method_sig_map.get(name) {
            return id;
        }
        let name_id = self.ensure_name(name);
        self.method_syms.push(MethodSymbol {
            name: name_id,
            mru_type: MRU_EMPTY,
            mru_entry: None,
        });
        let id = (self.method_syms.len() - 1) as u32;
        self.method_sig_map.insert(name.to_string(), id);
        id
    }

    /// Bind a method implementation for a receiver type
    pub fn set_method(&mut self, tid: u32, method_sym: u32, entry: MethodEntry) {
        self.method_table.insert((tid, method_sym), entry);
    }

    /// Resolve a method for a receiver type, via MRU then fallback table
    pub fn resolve_method(&mut self, tid: u32, method_sym: u32) -> Option<MethodEntry> {
        let sym = &mut self.method_syms[method_sym as usize];
        if sym.mru_type == tid {
            return sym.mru_entry;
        }
        let entry = self.method_table.get(&(tid, method_sym)).copied()?;
        sym.mru_type = tid;
        sym.mru_entry = Some(entry);
        Some(entry)
    }

    /// Method name for messages
    pub fn method_name(&self, method_sym: u32) -> &str {
        self.name(self.method_syms[method_sym as usize].name)
    }

    // ===== Field symbols =====

    /// Get or create a field symbol by name
    pub fn ensure_field_sym(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.field_sig_map.get(name) {
            return id;
        }
        let name_id = self.ensure_name(name);
        self.field_syms.push(FieldSymbol {
            name: name_id,
            mru_type: MRU_EMPTY,
            mru_offset: 0,
        });
        let id = (self.field_syms.len() - 1) as u32;
        self.field_sig_map.insert(name.to_string(), id);
        id
    }

    /// Record a field offset for a shape
    pub fn set_field_offset(&mut self, tid: u32, field_sym: u32, offset: u16) {
        self.field_table.insert((tid, field_sym), offset);
    }

    /// Resolve a field offset for a shape, via MRU then fallback table
    pub fn resolve_field(&mut self, tid: u32, field_sym: u32) -> Option<u16> {
        let sym = &mut self.field_syms[field_sym as usize];
        if sym.mru_type == tid {
            return Some(sym.mru_offset);
        }
        let offset = self.field_table.get(&(tid, field_sym)).copied()?;
        sym.mru_type = tid;
        sym.mru_offset = offset;
        Some(offset)
    }

    /// Field name for messages
    pub fn field_name(&self, field_sym: u32) -> &str {
        self.name(self.field_syms[field_sym as usize].name)
    }

    // ===== Tag types and literals =====

    /// Register a tag type
    pub fn add_tag_type(&mut self, name: &str, num_members: u8) -> u8 {
        let name_id = self.ensure_name(name);
        self.tag_types.push(TagType {
            name: name_id,
            num_members,
        });
        (self.tag_types.len() - 1) as u8
    }

    /// Intern a tag literal name, returning its id
    pub fn ensure_tag_literal(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.tag_lit_map.get(name) {
            return id;
        }
        let name_id = self.ensure_name(name);
        self.tag_lits.push(name_id);
        let id = (self.tag_lits.len() - 1) as u32;
        self.tag_lit_map.insert(name.to_string(), id);
        id
    }

    /// Tag literal name for messages
    pub fn tag_literal_name(&self, id: u32) -> &str {
        self.name(self.tag_lits[id as usize])
    }

    // ===== Object shapes =====

    /// Register an object shape with named fields, returning its type id
    ///
    /// Field offsets are recorded against the new type id in declaration
    /// order.
    pub fn add_object_shape(&mut self, name: &str, fields: &[&str]) -> u32 {
        let name_id = self.ensure_name(name);
        self.object_shapes.push(ObjectShape {
            name: name_id,
            num_fields: fields.len() as u16,
        });
        let tid = type_id::FIRST_OBJECT + (self.object_shapes.len() - 1) as u32;
        for (i, field) in fields.iter().enumerate() {
            let fsym = self.ensure_field_sym(field);
            self.set_field_offset(tid, fsym, i as u16);
        }
        tid
    }

    /// Field count for an object shape type id
    pub fn object_shape_field_count(&self, tid: u32) -> usize {
        self.object_shapes[(tid - type_id::FIRST_OBJECT) as usize].num_fields as usize
    }

    /// Shape name for messages
    pub fn object_shape_name(&self, tid: u32) -> &str {
        self.name(self.object_shapes[(tid - type_id::FIRST_OBJECT) as usize].name)
    }
}
