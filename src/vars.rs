use std::cell::RefCell;

use arcstr::ArcStr;
use rclite::Rc;
use smallvec::{smallvec, SmallVec};

use crate::{line::EraLineId, types::*};

pub type EraVarDims = SmallVec<[u32; 3]>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EraVarFlags: u32 {
        const CONST = 1 << 0;
        const SAVEDATA = 1 << 1;
        const GLOBAL = 1 << 2;
        const CHARADATA = 1 << 3;
        const DYNAMIC = 1 << 4;
        const REF = 1 << 5;
        const STATIC = 1 << 6;
    }
}

/// A resolved variable declaration.
#[derive(Debug, Clone)]
pub struct EraVarDecl {
    pub name: ArcStr,
    pub kind: ScalarValueKind,
    pub dims: EraVarDims,
    pub flags: EraVarFlags,
    pub init: Vec<ScalarValue>,
    pub filename: ArcStr,
    pub loc: SrcLoc,
}

impl EraVarDecl {
    pub fn is_const(&self) -> bool {
        self.flags.contains(EraVarFlags::CONST)
    }

    pub fn is_ref(&self) -> bool {
        self.flags.contains(EraVarFlags::REF)
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags.contains(EraVarFlags::DYNAMIC)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraVarData {
    Int(Vec<i64>),
    Str(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraVarArray {
    dims: EraVarDims,
    is_const: bool,
    data: EraVarData,
}

pub type EraVarCell = Rc<RefCell<EraVarArray>>;

impl EraVarArray {
    pub fn new(kind: ScalarValueKind, dims: EraVarDims) -> Self {
        let len = dims.iter().map(|&x| x as usize).product::<usize>().max(1);
        let data = if kind.is_str() {
            EraVarData::Str(vec![String::new(); len])
        } else {
            EraVarData::Int(vec![0; len])
        };
        EraVarArray {
            dims,
            is_const: false,
            data,
        }
    }

    pub fn from_decl(decl: &EraVarDecl) -> Result<Self, String> {
        let mut arr = EraVarArray::new(decl.kind, decl.dims.clone());
        if decl.init.len() > arr.len() {
            return Err(format!(
                "`{}` has {} initial values but only {} elements",
                decl.name,
                decl.init.len(),
                arr.len()
            ));
        }
        for (i, value) in decl.init.iter().enumerate() {
            arr.set_flat(i, value.clone())?;
        }
        arr.is_const = decl.is_const();
        Ok(arr)
    }

    pub fn into_cell(self) -> EraVarCell {
        Rc::new(RefCell::new(self))
    }

    pub fn kind(&self) -> ScalarValueKind {
        match self.data {
            EraVarData::Int(_) => ScalarValueKind::Int,
            EraVarData::Str(_) => ScalarValueKind::Str,
        }
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn is_const(&self) -> bool {
        self.is_const
    }

    pub fn len(&self) -> usize {
        match &self.data {
            EraVarData::Int(x) => x.len(),
            EraVarData::Str(x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts a (possibly partial) index list to a flat offset. Missing
    /// trailing indices are 0.
    pub fn flat_index(&self, indices: &[i64]) -> Result<usize, String> {
        if indices.len() > self.dims.len().max(1) {
            return Err(format!(
                "too many indices: expected at most {}, got {}",
                self.dims.len().max(1),
                indices.len()
            ));
        }
        let mut offset = 0usize;
        for (i, &dim) in self.dims.iter().enumerate() {
            let idx = indices.get(i).copied().unwrap_or(0);
            if idx < 0 || idx >= dim as i64 {
                return Err(format!("index {idx} out of range 0..{dim}"));
            }
            offset = offset * dim as usize + idx as usize;
        }
        Ok(offset)
    }

    pub fn get(&self, indices: &[i64]) -> Result<ScalarValue, String> {
        let idx = self.flat_index(indices)?;
        Ok(match &self.data {
            EraVarData::Int(x) => ScalarValue::Int(x[idx]),
            EraVarData::Str(x) => ScalarValue::Str(x[idx].clone()),
        })
    }

    pub fn set(&mut self, indices: &[i64], value: ScalarValue) -> Result<(), String> {
        if self.is_const {
            return Err("cannot assign to a constant".to_owned());
        }
        let idx = self.flat_index(indices)?;
        self.set_flat(idx, value)
    }

    fn set_flat(&mut self, idx: usize, value: ScalarValue) -> Result<(), String> {
        match (&mut self.data, value) {
            (EraVarData::Int(x), ScalarValue::Int(v)) => x[idx] = v,
            (EraVarData::Str(x), ScalarValue::Str(v)) => x[idx] = v,
            (EraVarData::Int(x), ScalarValue::Empty) => x[idx] = 0,
            (EraVarData::Str(x), ScalarValue::Empty) => x[idx].clear(),
            (_, value) => {
                return Err(format!(
                    "cannot store {} into a {} variable",
                    value.kind(),
                    self.kind()
                ))
            }
        }
        Ok(())
    }

    /// Fills every element with `value`.
    pub fn fill(&mut self, value: ScalarValue) -> Result<(), String> {
        for i in 0..self.len() {
            self.set_flat(i, value.clone())?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        match &mut self.data {
            EraVarData::Int(x) => x.iter_mut().for_each(|v| *v = 0),
            EraVarData::Str(x) => x.iter_mut().for_each(String::clear),
        }
    }
}

/// Builtin globals: name, kind, size.
const BUILTIN_GLOBALS: &[(&str, ScalarValueKind, u32)] = {
    use ScalarValueKind::{Int, Str};
    &[
        ("RESULT", Int, 1000),
        ("RESULTS", Str, 100),
        ("COUNT", Int, 1000),
        ("A", Int, 1000),
        ("B", Int, 1000),
        ("C", Int, 1000),
        ("D", Int, 1000),
        ("E", Int, 1000),
        ("F", Int, 1000),
        ("G", Int, 1000),
        ("H", Int, 1000),
        ("I", Int, 1000),
        ("J", Int, 1000),
        ("K", Int, 1000),
        ("L", Int, 1000),
        ("M", Int, 1000),
        ("N", Int, 1000),
        ("O", Int, 1000),
        ("P", Int, 1000),
        ("Q", Int, 1000),
        ("R", Int, 1000),
        ("S", Int, 1000),
        ("T", Int, 1000),
        ("U", Int, 1000),
        ("V", Int, 1000),
        ("W", Int, 1000),
        ("X", Int, 1000),
        ("Y", Int, 1000),
        ("Z", Int, 1000),
        ("FLAG", Int, 10000),
        ("TFLAG", Int, 1000),
        ("STR", Str, 20000),
        ("SAVESTR", Str, 100),
        ("SELECTCOM", Int, 1),
        ("PREVCOM", Int, 1),
        ("NEXTCOM", Int, 1),
        ("MASTER", Int, 1),
        ("TARGET", Int, 1),
        ("ASSI", Int, 1),
        ("PLAYER", Int, 1),
        ("MONEY", Int, 1),
        ("DAY", Int, 1),
        ("TIME", Int, 1),
        ("ITEM", Int, 1000),
        ("ITEMSALES", Int, 1000),
        ("ITEMPRICE", Int, 1000),
        ("BOUGHT", Int, 1),
        ("RANDDATA", Int, 1),
    ]
};

/// Per-function variables whose size comes from `#LOCALSIZE`/`#LOCALSSIZE`
/// or the configuration.
pub const FUNC_LOCAL_VARS: [(&str, ScalarValueKind); 4] = [
    ("LOCAL", ScalarValueKind::Int),
    ("LOCALS", ScalarValueKind::Str),
    ("ARG", ScalarValueKind::Int),
    ("ARGS", ScalarValueKind::Str),
];

pub fn is_builtin_var(name: &str) -> bool {
    BUILTIN_GLOBALS
        .iter()
        .any(|(x, ..)| x.eq_ignore_ascii_case(name))
        || FUNC_LOCAL_VARS
            .iter()
            .any(|(x, _)| x.eq_ignore_ascii_case(name))
}

/// Sizes of the implicit per-function arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraLocalSizes {
    pub local: u32,
    pub locals: u32,
    pub arg: u32,
    pub args: u32,
}

/// Per-function storage shared by every invocation of that function.
#[derive(Debug, Default)]
pub struct EraFuncVars {
    vars: FxHashMap<ArcStr, EraVarCell>,
    /// Declarations of private variables, including REF and DYNAMIC ones,
    /// which have no static storage.
    decls: FxIndexMap<ArcStr, EraVarDecl>,
}

impl EraFuncVars {
    pub fn new(sizes: EraLocalSizes) -> Self {
        let mut this = EraFuncVars::default();
        let [local, locals, arg, args] = FUNC_LOCAL_VARS;
        for ((name, kind), size) in [
            (local, sizes.local),
            (locals, sizes.locals),
            (arg, sizes.arg),
            (args, sizes.args),
        ] {
            this.vars.insert(
                ArcStr::from(name),
                EraVarArray::new(kind, smallvec![size]).into_cell(),
            );
        }
        this
    }

    /// Declares a private variable. Returns the previous declaration on
    /// collision.
    pub fn declare(&mut self, decl: EraVarDecl) -> Result<(), String> {
        if self.decls.contains_key(&decl.name) || self.vars.contains_key(&decl.name) {
            return Err(format!("variable `{}` is already declared in this function", decl.name));
        }
        if !decl.is_ref() && !decl.is_dynamic() {
            let arr = EraVarArray::from_decl(&decl)?;
            self.vars.insert(decl.name.clone(), arr.into_cell());
        }
        self.decls.insert(decl.name.clone(), decl);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EraVarCell> {
        self.vars.get(name)
    }

    pub fn decl(&self, name: &str) -> Option<&EraVarDecl> {
        self.decls.get(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<ScalarValueKind> {
        if let Some(decl) = self.decls.get(name) {
            return Some(decl.kind);
        }
        self.vars.get(name).map(|x| x.borrow().kind())
    }

    /// Private variables that need fresh storage for every call.
    pub fn dynamic_decls(&self) -> impl Iterator<Item = &EraVarDecl> {
        self.decls.values().filter(|x| x.is_dynamic() && !x.is_ref())
    }
}

/// Global variable storage. Function-private storage is kept per function
/// label, so every contribution to an event owns its own locals;
/// frame-private storage lives in the call frames.
#[derive(Debug, Default)]
pub struct EraVarPool {
    globals: FxHashMap<ArcStr, EraVarCell>,
    global_decls: FxHashMap<ArcStr, EraVarDecl>,
    funcs: FxHashMap<EraLineId, EraFuncVars>,
}

impl EraVarPool {
    pub fn new() -> Self {
        let mut this = EraVarPool::default();
        for &(name, kind, size) in BUILTIN_GLOBALS {
            this.globals.insert(
                ArcStr::from(name),
                EraVarArray::new(kind, smallvec![size]).into_cell(),
            );
        }
        this
    }

    /// Declares a global. A declaration may replace a builtin variable of the
    /// same name, but not another declaration.
    pub fn add_global(&mut self, decl: EraVarDecl) -> Result<(), String> {
        if self.global_decls.contains_key(&decl.name) {
            return Err(format!("variable `{}` is already declared", decl.name));
        }
        let arr = EraVarArray::from_decl(&decl)?;
        self.globals.insert(decl.name.clone(), arr.into_cell());
        self.global_decls.insert(decl.name.clone(), decl);
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Option<&EraVarCell> {
        self.globals.get(name)
    }

    pub fn global_decl(&self, name: &str) -> Option<&EraVarDecl> {
        self.global_decls.get(name)
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    /// Reads a constant global, for load-time evaluation.
    pub fn get_const(&self, name: &str, indices: &[i64]) -> Option<ScalarValue> {
        let var = self.globals.get(name)?.borrow();
        if !var.is_const() {
            return None;
        }
        var.get(indices).ok()
    }

    pub fn add_func(&mut self, func: EraLineId, sizes: EraLocalSizes) -> &mut EraFuncVars {
        self.funcs
            .entry(func)
            .or_insert_with(|| EraFuncVars::new(sizes))
    }

    pub fn func(&self, func: EraLineId) -> Option<&EraFuncVars> {
        self.funcs.get(&func)
    }

    pub fn func_mut(&mut self, func: EraLineId) -> Option<&mut EraFuncVars> {
        self.funcs.get_mut(&func)
    }

    /// Static lookup of a variable's kind as seen from inside `func`.
    pub fn kind_of(&self, func: Option<EraLineId>, name: &str) -> Option<ScalarValueKind> {
        if let Some(kind) = func
            .and_then(|f| self.funcs.get(&f))
            .and_then(|f| f.kind_of(name))
        {
            return Some(kind);
        }
        self.globals.get(name).map(|x| x.borrow().kind())
    }

    pub fn is_known(&self, func: Option<EraLineId>, name: &str) -> bool {
        self.kind_of(func, name).is_some()
    }

    /// Resolves a variable visible from `func`, ignoring frame-private ones.
    pub fn resolve(&self, func: EraLineId, name: &str) -> Option<EraVarCell> {
        if let Some(var) = self.funcs.get(&func).and_then(|f| f.get(name)) {
            return Some(var.clone());
        }
        self.globals.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, kind: ScalarValueKind, dims: &[u32], flags: EraVarFlags) -> EraVarDecl {
        EraVarDecl {
            name: ArcStr::from(name),
            kind,
            dims: dims.iter().copied().collect(),
            flags,
            init: Vec::new(),
            filename: ArcStr::new(),
            loc: SrcLoc::default(),
        }
    }

    #[test]
    fn multi_dim_indexing() -> anyhow::Result<()> {
        let mut arr = EraVarArray::new(ScalarValueKind::Int, smallvec![3, 4]);
        arr.set(&[2, 1], ScalarValue::Int(7)).map_err(anyhow::Error::msg)?;
        assert_eq!(arr.flat_index(&[2, 1]).ok(), Some(9));
        assert_eq!(arr.get(&[2, 1]).ok(), Some(ScalarValue::Int(7)));
        assert_eq!(arr.get(&[2]).ok(), Some(ScalarValue::Int(0)));
        assert!(arr.get(&[3, 0]).is_err());
        assert!(arr.get(&[0, 0, 0]).is_err());
        assert!(arr.set(&[0], ScalarValue::Str("x".into())).is_err());
        Ok(())
    }

    #[test]
    fn const_arrays_are_read_only() -> anyhow::Result<()> {
        let mut pool = EraVarPool::new();
        let mut d = decl("PRICES", ScalarValueKind::Int, &[3], EraVarFlags::CONST);
        d.init = vec![ScalarValue::Int(10), ScalarValue::Int(20)];
        pool.add_global(d).map_err(anyhow::Error::msg)?;
        assert_eq!(pool.get_const("PRICES", &[1]), Some(ScalarValue::Int(20)));
        assert_eq!(pool.get_const("FLAG", &[0]), None);
        let var = pool.get_global("PRICES").expect("declared");
        assert!(var.borrow_mut().set(&[0], ScalarValue::Int(1)).is_err());
        assert!(pool
            .add_global(decl("PRICES", ScalarValueKind::Int, &[1], EraVarFlags::empty()))
            .is_err());
        Ok(())
    }

    #[test]
    fn function_scope_shadows_globals() -> anyhow::Result<()> {
        let mut pool = EraVarPool::new();
        let sizes = EraLocalSizes {
            local: 10,
            locals: 5,
            arg: 10,
            args: 5,
        };
        let id = EraLineId(4);
        let f = pool.add_func(id, sizes);
        f.declare(decl("COUNT", ScalarValueKind::Str, &[1], EraVarFlags::empty()))
            .map_err(anyhow::Error::msg)?;
        f.declare(decl("R", ScalarValueKind::Int, &[1], EraVarFlags::REF))
            .map_err(anyhow::Error::msg)?;
        assert!(f.get("R").is_none());
        assert_eq!(pool.kind_of(Some(id), "COUNT"), Some(ScalarValueKind::Str));
        assert_eq!(pool.kind_of(None, "COUNT"), Some(ScalarValueKind::Int));
        assert_eq!(pool.kind_of(Some(id), "R"), Some(ScalarValueKind::Int));
        let local = pool.resolve(id, "LOCAL").expect("implicit local");
        assert_eq!(local.borrow().len(), 10);
        Ok(())
    }
}
