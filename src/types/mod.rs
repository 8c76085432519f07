//! The type lattice.
//!
//! Types are first-class runtime values with a built-in subtype relation.
//! Abstract kinds (`object`, `primitive`, `number`, `collection`, ...) sit
//! above the concrete ones and exist only as bounds for dispatch checks;
//! no instance ever has an abstract type.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ty {
    pub kind: TyKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum TyKind {
    /// The top of the lattice.
    Object,

    // Abstract bounds
    Primitive,
    Number,
    Collection,
    AnyStruct,
    AnyTable,
    AnyList,
    AnySet,
    AnyRow,
    AnyAggregate,

    // Primitives
    Int,
    Float,
    Bool,
    String,
    Null,
    /// The type of type values themselves.
    TypeValue,

    // Containers
    Table(TableTy),
    List(Box<Ty>),
    Set(Box<Ty>),
    Row(TableTy),
    Struct(Vec<(String, Ty)>),

    // Qualifiers
    /// A vectorized element inside a GROUP BY scope. Deliberately a sibling
    /// of its element type, never a subtype.
    Aggregate(Box<Ty>),
    Union(Vec<Ty>),

    Function,
    /// A language-level exception type; `None` matches every kind.
    Exception(Option<ErrorKind>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableTy {
    /// Database name. Anonymous for projection results.
    pub name: Option<String>,
    pub columns: Vec<(String, Ty)>,
    /// Set on tables produced by queries, as opposed to stored tables.
    pub temporary: bool,
    pub primary_key: Vec<String>,
}

impl TableTy {
    pub fn anonymous(columns: Vec<(String, Ty)>) -> Self {
        TableTy {
            name: None,
            columns,
            temporary: true,
            primary_key: vec![],
        }
    }

    pub fn stored<S: Into<String>>(name: S, columns: Vec<(String, Ty)>) -> Self {
        TableTy {
            name: Some(name.into()),
            columns,
            temporary: false,
            primary_key: vec!["id".to_string()],
        }
    }

    pub fn column(&self, name: &str) -> Option<&Ty> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// The columns a row constructor must supply: everything but the keys.
    pub fn value_columns(&self) -> impl Iterator<Item = &(String, Ty)> {
        self.columns
            .iter()
            .filter(|(n, _)| !self.primary_key.contains(n))
    }

    fn same_shape(&self, other: &TableTy) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|((an, at), (bn, bt))| an == bn && at == bt)
    }
}

impl Ty {
    pub fn new(kind: TyKind) -> Self {
        Ty {
            kind,
            nullable: false,
        }
    }

    pub fn object() -> Self {
        Ty::new(TyKind::Object)
    }
    pub fn primitive() -> Self {
        Ty::new(TyKind::Primitive)
    }
    pub fn number() -> Self {
        Ty::new(TyKind::Number)
    }
    pub fn collection() -> Self {
        Ty::new(TyKind::Collection)
    }
    pub fn int() -> Self {
        Ty::new(TyKind::Int)
    }
    pub fn float() -> Self {
        Ty::new(TyKind::Float)
    }
    pub fn bool() -> Self {
        Ty::new(TyKind::Bool)
    }
    pub fn string() -> Self {
        Ty::new(TyKind::String)
    }
    pub fn null() -> Self {
        Ty::new(TyKind::Null)
    }
    pub fn list(elem: Ty) -> Self {
        Ty::new(TyKind::List(Box::new(elem)))
    }
    pub fn set(elem: Ty) -> Self {
        Ty::new(TyKind::Set(Box::new(elem)))
    }
    pub fn table(table: TableTy) -> Self {
        Ty::new(TyKind::Table(table))
    }
    pub fn row(table: TableTy) -> Self {
        Ty::new(TyKind::Row(table))
    }
    pub fn aggregate(elem: Ty) -> Self {
        Ty::new(TyKind::Aggregate(Box::new(elem)))
    }
    pub fn union(variants: Vec<Ty>) -> Self {
        Ty::new(TyKind::Union(variants))
    }
    pub fn exception(kind: Option<ErrorKind>) -> Self {
        Ty::new(TyKind::Exception(kind))
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// The subtype check `self <= sup`. Reflexive and transitive.
    pub fn is_subtype_of(&self, sup: &Ty) -> bool {
        use TyKind::*;
        match (&self.kind, &sup.kind) {
            // A union on the left must match in all its variants; on the
            // right, in at least one.
            (Union(variants), _) => variants.iter().all(|v| v.is_subtype_of(sup)),
            (_, Union(variants)) => variants.iter().any(|v| self.is_subtype_of(v)),

            (_, Object) => true,

            (Int | Float, Number) => true,
            (Int | Float | Number | Bool | String | Null | TypeValue, Primitive) => true,

            (Table(_) | List(_) | Set(_) | AnyTable | AnyList | AnySet, Collection) => true,
            (Table(_), AnyTable) => true,
            (List(_), AnyList) => true,
            (Set(_), AnySet) => true,
            (Row(_), AnyRow) => true,
            (Row(_) | Struct(_), AnyStruct) => true,
            (Aggregate(_), AnyAggregate) => true,

            (List(a), List(b)) | (Set(a), Set(b)) | (Aggregate(a), Aggregate(b)) => {
                a.is_subtype_of(b)
            }
            (Table(a), Table(b)) => a.same_shape(b),
            (Row(a), Row(b)) => a.same_shape(b),
            (Struct(a), Struct(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((an, at), (bn, bt))| an == bn && at.is_subtype_of(bt))
            }

            (Exception(_), Exception(None)) => true,
            (Exception(Some(a)), Exception(Some(b))) => a == b,

            (a, b) => a == b,
        }
    }

    /// Generic application `self[arg]`, e.g. `list[int]`.
    pub fn apply(&self, arg: Ty) -> Result<Ty, Error> {
        match &self.kind {
            TyKind::AnyList => Ok(Ty::list(arg)),
            TyKind::AnySet => Ok(Ty::set(arg)),
            TyKind::AnyAggregate => Ok(Ty::aggregate(arg)),
            TyKind::AnyRow => match arg.kind {
                TyKind::Table(t) => Ok(Ty::row(t)),
                _ => Err(Error::new(
                    ErrorKind::Type,
                    format!("row[..] expects a table type, got {arg}"),
                )),
            },
            _ => Err(Error::new(
                ErrorKind::Type,
                format!("type {self} isn't a container"),
            )),
        }
    }

    /// Structural members: columns of a table or row, fields of a struct,
    /// the single `value` element of a list or set.
    pub fn elems(&self) -> Vec<(String, Ty)> {
        match &self.kind {
            TyKind::Table(t) | TyKind::Row(t) => t.columns.clone(),
            TyKind::Struct(fields) => fields.clone(),
            TyKind::List(elem) | TyKind::Set(elem) => {
                vec![("value".to_string(), (**elem).clone())]
            }
            _ => vec![],
        }
    }

    /// Flattens structured members to `(path, leaf)` pairs, joining nested
    /// paths with `_`. Used for column aliasing and row destructuring.
    pub fn flatten(&self) -> Vec<(String, Ty)> {
        fn walk(prefix: &str, name: &str, ty: &Ty, out: &mut Vec<(String, Ty)>) {
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}_{name}")
            };
            match &ty.kind {
                TyKind::Struct(fields) => {
                    for (n, t) in fields {
                        walk(&path, n, t, out);
                    }
                }
                _ => out.push((path, ty.clone())),
            }
        }

        let mut out = Vec::new();
        match &self.kind {
            TyKind::Table(_) | TyKind::Row(_) | TyKind::Struct(_) | TyKind::List(_)
            | TyKind::Set(_) => {
                for (name, ty) in self.elems() {
                    walk("", &name, &ty, &mut out);
                }
            }
            _ => out.push(("value".to_string(), self.clone())),
        }
        out
    }

    /// The element type of an aggregate, or the type itself.
    pub fn collapsed(&self) -> Ty {
        match &self.kind {
            TyKind::Aggregate(elem) => (**elem).clone(),
            _ => self.clone(),
        }
    }
}

impl Display for Ty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use TyKind::*;
        match &self.kind {
            Object => write!(f, "object")?,
            Primitive => write!(f, "primitive")?,
            Number => write!(f, "number")?,
            Collection => write!(f, "collection")?,
            AnyStruct => write!(f, "struct")?,
            AnyTable => write!(f, "table")?,
            AnyList => write!(f, "list")?,
            AnySet => write!(f, "set")?,
            AnyRow => write!(f, "row")?,
            AnyAggregate => write!(f, "aggregate")?,
            Int => write!(f, "int")?,
            Float => write!(f, "float")?,
            Bool => write!(f, "bool")?,
            String => write!(f, "string")?,
            Null => write!(f, "null")?,
            TypeValue => write!(f, "type")?,
            Table(t) => {
                match &t.name {
                    Some(name) => write!(f, "table {name}")?,
                    None => write!(f, "table")?,
                }
                write!(f, "[")?;
                for (i, (n, ty)) in t.columns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{n}: {ty}")?;
                }
                write!(f, "]")?
            }
            List(elem) => write!(f, "list[{elem}]")?,
            Set(elem) => write!(f, "set[{elem}]")?,
            Row(t) => write!(f, "row[{}]", Ty::table(t.clone()))?,
            Struct(fields) => {
                write!(f, "struct[")?;
                for (i, (n, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{n}: {ty}")?;
                }
                write!(f, "]")?
            }
            Aggregate(elem) => write!(f, "aggregate[{elem}]")?,
            Union(variants) => {
                write!(f, "union[")?;
                for (i, v) in variants.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")?
            }
            Function => write!(f, "function")?,
            Exception(Some(kind)) => write!(f, "{kind}")?,
            Exception(None) => write!(f, "Error")?,
        }
        if self.nullable {
            write!(f, "?")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn subtype_is_reflexive() {
        let samples = [
            Ty::int(),
            Ty::float(),
            Ty::string(),
            Ty::list(Ty::int()),
            Ty::aggregate(Ty::string()),
            Ty::table(TableTy::stored(
                "P",
                vec![
                    ("id".to_string(), Ty::int()),
                    ("name".to_string(), Ty::string()),
                ],
            )),
            Ty::union(vec![Ty::int(), Ty::string()]),
        ];
        for t in &samples {
            assert!(t.is_subtype_of(t), "{t} <= {t} must hold");
            assert!(t.is_subtype_of(&Ty::object()), "{t} <= object must hold");
        }
    }

    #[test]
    fn primitive_chain() {
        assert!(Ty::int().is_subtype_of(&Ty::number()));
        assert!(Ty::float().is_subtype_of(&Ty::number()));
        assert!(Ty::number().is_subtype_of(&Ty::primitive()));
        assert!(Ty::int().is_subtype_of(&Ty::primitive()));
        assert!(!Ty::string().is_subtype_of(&Ty::number()));
        assert!(!Ty::number().is_subtype_of(&Ty::int()));
    }

    #[test]
    fn containers_are_collections() {
        let table = Ty::table(TableTy::anonymous(vec![("x".to_string(), Ty::int())]));
        assert!(table.is_subtype_of(&Ty::collection()));
        assert!(Ty::list(Ty::int()).is_subtype_of(&Ty::collection()));
        assert!(!Ty::int().is_subtype_of(&Ty::collection()));
    }

    #[test]
    fn rows_are_structs() {
        let t = TableTy::stored("P", vec![("id".to_string(), Ty::int())]);
        assert!(Ty::row(t).is_subtype_of(&Ty::new(TyKind::AnyStruct)));
    }

    #[test]
    fn aggregate_is_a_sibling_not_a_subtype() {
        assert!(!Ty::aggregate(Ty::int()).is_subtype_of(&Ty::int()));
        assert!(!Ty::int().is_subtype_of(&Ty::aggregate(Ty::int())));
        assert!(Ty::aggregate(Ty::int()).is_subtype_of(&Ty::aggregate(Ty::number())));
    }

    #[test]
    fn union_matches_either_side() {
        let u = Ty::union(vec![Ty::collection(), Ty::new(TyKind::AnyStruct)]);
        let table = Ty::table(TableTy::anonymous(vec![("x".to_string(), Ty::int())]));
        assert!(table.is_subtype_of(&u));
        assert!(!Ty::string().is_subtype_of(&u));
        // union on the left: all variants must fit
        assert!(Ty::union(vec![Ty::int(), Ty::float()]).is_subtype_of(&Ty::number()));
        assert!(!Ty::union(vec![Ty::int(), Ty::string()]).is_subtype_of(&Ty::number()));
    }

    #[test]
    fn exception_kinds() {
        use crate::error::ErrorKind;
        assert!(Ty::exception(Some(ErrorKind::Value)).is_subtype_of(&Ty::exception(None)));
        assert!(!Ty::exception(Some(ErrorKind::Value))
            .is_subtype_of(&Ty::exception(Some(ErrorKind::Type))));
        assert!(!Ty::exception(None).is_subtype_of(&Ty::exception(Some(ErrorKind::Type))));
    }

    #[test]
    fn generic_application() {
        let list = Ty::new(TyKind::AnyList);
        assert_eq!(list.apply(Ty::int()).unwrap(), Ty::list(Ty::int()));
        assert!(Ty::int().apply(Ty::int()).is_err());
    }

    #[test]
    fn flatten_joins_struct_paths() {
        let t = Ty::table(TableTy::anonymous(vec![
            ("id".to_string(), Ty::int()),
            (
                "loc".to_string(),
                Ty::new(TyKind::Struct(vec![
                    ("lat".to_string(), Ty::float()),
                    ("lon".to_string(), Ty::float()),
                ])),
            ),
        ]));
        let flat: Vec<String> = t.flatten().into_iter().map(|(p, _)| p).collect();
        assert_eq!(flat, vec!["id", "loc_lat", "loc_lon"]);
    }

    #[test]
    fn subtype_is_total_over_kind_samples() {
        // Decidability smoke test: every pair of sample types answers.
        let mut samples = vec![
            Ty::object(),
            Ty::primitive(),
            Ty::number(),
            Ty::collection(),
            Ty::int(),
            Ty::float(),
            Ty::bool(),
            Ty::string(),
            Ty::null(),
            Ty::list(Ty::int()),
            Ty::set(Ty::string()),
            Ty::aggregate(Ty::int()),
            Ty::union(vec![Ty::int(), Ty::null()]),
        ];
        for kind in ErrorKind::iter() {
            samples.push(Ty::exception(Some(kind)));
        }
        for a in &samples {
            for b in &samples {
                let _ = a.is_subtype_of(b);
            }
        }
    }
}
