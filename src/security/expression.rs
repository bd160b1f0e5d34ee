/// A boolean expression tree over named checks.
///
/// Check names resolve against the metadata registry at evaluation time;
/// the registry builder verifies at startup that every referenced name is
/// registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionExpression {
    /// A single named check.
    Check(String),
    /// Conjunction; stops at the first child returning false.
    AllOf(Vec<PermissionExpression>),
    /// Disjunction; stops at the first child returning true.
    AnyOf(Vec<PermissionExpression>),
    /// Negation.
    Not(Box<PermissionExpression>),
}

impl PermissionExpression {
    pub fn check(name: impl Into<String>) -> Self {
        PermissionExpression::Check(name.into())
    }

    pub fn all_of(children: impl IntoIterator<Item = PermissionExpression>) -> Self {
        PermissionExpression::AllOf(children.into_iter().collect())
    }

    pub fn any_of(children: impl IntoIterator<Item = PermissionExpression>) -> Self {
        PermissionExpression::AnyOf(children.into_iter().collect())
    }

    pub fn negate(self) -> Self {
        PermissionExpression::Not(Box::new(self))
    }

    /// All check names referenced anywhere in the tree.
    pub fn check_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, into: &mut Vec<&'a str>) {
        match self {
            PermissionExpression::Check(name) => into.push(name),
            PermissionExpression::AllOf(children) | PermissionExpression::AnyOf(children) => {
                for child in children {
                    child.collect_names(into);
                }
            }
            PermissionExpression::Not(child) => child.collect_names(into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_names() {
        let expr = PermissionExpression::any_of([
            PermissionExpression::check("is admin"),
            PermissionExpression::all_of([
                PermissionExpression::check("is owner"),
                PermissionExpression::check("is published").negate(),
            ]),
        ]);
        assert_eq!(expr.check_names(), vec!["is admin", "is owner", "is published"]);
    }
}
