//! Panic state and stack traces
//!
//! The panic slot is either empty or holds exactly one payload: an
//! allocated message or a first-class error value. Once a panic is raised,
//! no opcode side effect other than unwinding is permitted; the dispatch
//! loop returns immediately and the outer wrapper builds the trace from the
//! still-intact frame chain before reporting.

use sable_bytecode::{inst_len, NULL_ID};

use crate::fiber::FrameIter;
use crate::value::{Tag, Value};
use crate::vm::Vm;
use crate::VmError;

/// The panic slot
#[derive(Debug, Clone, Default)]
pub enum PanicPayload {
    /// No panic pending
    #[default]
    None,
    /// A message
    Msg(String),
    /// An unhandled error value that escaped the root frame
    Err(Value),
}

/// One formatted stack trace frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Enclosing function name, `"main"` at top level
    pub name: String,
    /// 1-based source line
    pub line: u32,
    /// 1-based source column
    pub col: u32,
    /// Code offset the frame was executing
    pub pc: u32,
}

impl Vm {
    /// Raise a panic with a message, saving the registers for the trace
    pub(crate) fn panic_msg(&mut self, pc: usize, fp: *mut Value, msg: String) -> VmError {
        self.pc = pc;
        self.fp = fp;
        self.panic_payload = PanicPayload::Msg(msg.clone());
        VmError::Panic(msg)
    }

    /// Raise a panic carrying an error value that escaped the root frame
    pub(crate) fn panic_err(&mut self, pc: usize, fp: *mut Value, err: Value) -> VmError {
        self.pc = pc;
        self.fp = fp;
        let msg = format!("error.{}", self.symbols.tag_literal_name(err.as_enum_id()));
        self.panic_payload = PanicPayload::Err(err);
        VmError::Panic(msg)
    }

    /// One-line summary of the pending panic
    pub fn panic_summary(&self) -> String {
        match &self.panic_payload {
            PanicPayload::None => "panic".to_string(),
            PanicPayload::Msg(m) => m.clone(),
            PanicPayload::Err(v) => {
                format!("error.{}", self.symbols.tag_literal_name(v.as_enum_id()))
            }
        }
    }

    /// Walk the live frame chain into a formatted trace
    ///
    /// The top frame's location is attributed to the instruction being
    /// executed when the panic was raised; lower frames are attributed to
    /// their call sites (the instruction preceding each saved return pc).
    pub(crate) fn build_stack_trace(&self) -> Vec<StackFrame> {
        let code = &self.program.code;
        let mut frames = Vec::new();
        let mut pc = self.pc;
        let mut first = true;
        unsafe {
            for fp in FrameIter::new(self.fp) {
                let query = if first && pc < code.len() {
                    pc + inst_len(code, pc) - 1
                } else {
                    pc
                };
                let (name, line, col) = match self.program.debug_entry_at(query) {
                    Some(e) => {
                        let name = if e.frame == NULL_ID {
                            "main".to_string()
                        } else {
                            self.program.funcs[e.frame as usize].name.clone()
                        };
                        let (line, col) = self.program.line_col(e.src_pos);
                        (name, line, col)
                    }
                    None => ("main".to_string(), 0, 0),
                };
                frames.push(StackFrame {
                    name,
                    line,
                    col,
                    pc: query as u32,
                });
                let ret_pc = (*fp.add(2)).raw() as usize;
                pc = ret_pc.saturating_sub(1);
                first = false;
            }
        }
        frames
    }

    /// Format the pending panic and trace the way the CLI reports them
    pub fn format_stack_trace(&self) -> String {
        let mut out = format!("panic: {}\n", self.panic_summary());
        for f in &self.stack_trace {
            out.push_str(&format!(
                "  at {} ({}:{}:{})\n",
                f.name, self.program.src_name, f.line, f.col
            ));
        }
        out
    }

    /// Human-readable rendering of a value, used by `print` and messages
    pub fn value_display(&self, v: Value) -> String {
        match v.get_tag() {
            Tag::Number => {
                let n = v.as_f64().unwrap();
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", n as i64)
                } else {
                    format!("{n}")
                }
            }
            Tag::None => "none".to_string(),
            Tag::Bool => format!("{}", v.as_bool().unwrap()),
            Tag::Integer => format!("{}", v.as_i32().unwrap()),
            Tag::StaticAstring | Tag::StaticUstring => {
                match self.value_string_bytes(v) {
                    Some((ptr, len)) => {
                        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    None => String::new(),
                }
            }
            Tag::Enum => {
                if v.is_error() {
                    format!("error.{}", self.symbols.tag_literal_name(v.as_enum_id()))
                } else {
                    format!("{:?}", v)
                }
            }
            Tag::Sentinel => "<sentinel>".to_string(),
            Tag::Pointer => unsafe {
                let obj = v.as_ptr();
                let tid = (*obj).head.type_id;
                match tid {
                    crate::object::type_id::LIST => {
                        let items: Vec<String> = (&(*obj)
                            .list)
                            .elems
                            .iter()
                            .map(|e| self.value_display(*e))
                            .collect();
                        format!("[{}]", items.join(", "))
                    }
                    crate::object::type_id::MAP => {
                        format!("{{map of {}}}", (&(*obj).map).inner.len())
                    }
                    crate::object::type_id::CLOSURE | crate::object::type_id::LAMBDA => {
                        "<function>".to_string()
                    }
                    crate::object::type_id::FIBER => "<fiber>".to_string(),
                    _ => match self.value_string_bytes(v) {
                        Some((ptr, len)) => {
                            let bytes = std::slice::from_raw_parts(ptr, len);
                            String::from_utf8_lossy(bytes).into_owned()
                        }
                        None if tid >= crate::object::type_id::FIRST_OBJECT => {
                            format!("<{}>", self.symbols.object_shape_name(tid))
                        }
                        None => "<object>".to_string(),
                    },
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    #[test]
    fn test_value_display() {
        let mut vm = Vm::new(VmOptions::default());
        assert_eq!(vm.value_display(Value::number(3.0)), "3");
        assert_eq!(vm.value_display(Value::number(3.5)), "3.5");
        assert_eq!(vm.value_display(Value::none()), "none");
        assert_eq!(vm.value_display(Value::boolean(true)), "true");
        let s = vm.new_string("hi");
        assert_eq!(vm.value_display(s), "hi");
        let l = vm.alloc_list(vec![Value::number(1.0), Value::number(2.0)]);
        assert_eq!(vm.value_display(l), "[1, 2]");
        vm.release(s);
        vm.release(l);
    }

    #[test]
    fn test_panic_summary_err() {
        let mut vm = Vm::new(VmOptions::default());
        let err = Value::error_tag(crate::symbols::error_sym::NOT_FOUND);
        vm.panic_payload = PanicPayload::Err(err);
        assert_eq!(vm.panic_summary(), "error.NotFound");
    }
}
