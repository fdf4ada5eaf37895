use crate::analysis::WorklistOrder;

pub struct Settings {
    /// Run the constant analysis and apply what it finds (unreachable code, constant values,
    /// decided branches)
    pub fold_constants: bool,

    /// Cancel values that are pushed only to be popped again
    pub remove_pops: bool,

    /// Remove dead stores and pack local variables into as few slots as possible
    pub optimize_locals: bool,

    /// Rebuild the `LocalVariableTable` after slots are reassigned
    ///
    /// When this is off, a method whose slots were reassigned loses its `LocalVariableTable`
    /// altogether, since the old one would name the wrong slots.
    pub rebuild_local_variable_table: bool,

    /// Carry the `LineNumberTable` through to the output
    pub keep_line_numbers: bool,

    /// Evaluate calls to a handful of side-effect free library methods (`String.length`,
    /// `Math.max`, ...) when all of their arguments are known
    pub interpret_pure_methods: bool,

    /// Order in which the constant analysis processes pending work
    ///
    /// Does not affect the results, only how much work is done to get there.
    pub worklist_order: WorklistOrder,
}

impl Settings {
    /// Everything enabled
    pub fn new() -> Settings {
        Settings {
            fold_constants: true,
            remove_pops: true,
            optimize_locals: true,
            rebuild_local_variable_table: true,
            keep_line_numbers: true,
            interpret_pure_methods: true,
            worklist_order: WorklistOrder::Fifo,
        }
    }

    /// Only decode and re-encode
    pub fn passthrough() -> Settings {
        Settings {
            fold_constants: false,
            remove_pops: false,
            optimize_locals: false,
            ..Settings::new()
        }
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings::new()
    }
}
