//! Department checks: which departments the service accepts, and whether a
//! model-suggested department agrees with the one the patient picked.

/// Broad categories and the sub-specialties they cover
const ALIAS_GROUPS: &[(&str, &[&str])] = &[
    (
        "内科",
        &["呼吸内科", "消化内科", "心内科", "神经内科", "内分泌科", "血液科", "肾内科"],
    ),
    ("外科", &["普外科", "泌尿外科", "胸外科", "神经外科", "骨科"]),
    ("五官科", &["耳鼻喉科", "眼科", "口腔科"]),
    ("妇产科", &["妇科", "产科"]),
    ("儿科", &["小儿内科", "小儿外科", "新生儿科"]),
    ("皮肤科", &["皮肤性病科"]),
    ("肿瘤科", &["肿瘤内科", "放疗科"]),
];

/// Allow-list of departments the pipeline can serve
#[derive(Debug, Clone)]
pub struct DepartmentValidator {
    serviceable: Vec<String>,
}

impl DepartmentValidator {
    pub fn new<I, S>(departments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            serviceable: departments
                .into_iter()
                .map(|d| normalize(d.as_ref()))
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn is_serviceable(&self, department: &str) -> bool {
        let department = normalize(department);
        self.serviceable.iter().any(|d| *d == department)
    }

    pub fn departments(&self) -> &[String] {
        &self.serviceable
    }
}

/// Whether the model's suggested department agrees with the patient's choice.
///
/// Fails open: an empty value on either side counts as a match, since missing
/// information must not flag a record for the reviewing doctor.
pub fn matches_suggestion(user_department: &str, model_department: &str) -> bool {
    let user = normalize(user_department);
    let model = normalize(model_department);

    if user.is_empty() || model.is_empty() {
        return true;
    }
    if user == model {
        return true;
    }
    // "内科" vs "呼吸内科"
    if user.contains(&model) || model.contains(&user) {
        return true;
    }

    ALIAS_GROUPS
        .iter()
        .any(|(category, members)| in_group(&user, category, members) && in_group(&model, category, members))
}

fn in_group(department: &str, category: &str, members: &[&str]) -> bool {
    department.contains(category)
        || members
            .iter()
            .any(|member| member.contains(department) || department.contains(member))
}

fn normalize(department: &str) -> String {
    department.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_ignores_surrounding_whitespace() {
        let validator = DepartmentValidator::new(["耳鼻喉科", "呼吸内科"]);
        assert!(validator.is_serviceable(" 耳鼻喉科 "));
        assert!(!validator.is_serviceable("骨科"));
        assert!(!validator.is_serviceable(""));
    }

    #[test]
    fn empty_allow_list_entries_are_dropped() {
        let validator = DepartmentValidator::new(["", "  ", "眼科"]);
        assert_eq!(validator.departments(), ["眼科".to_string()]);
    }

    #[test]
    fn specialization_matches_broad_category() {
        assert!(matches_suggestion("呼吸内科", "内科"));
        assert!(matches_suggestion("内科", "呼吸内科"));
    }

    #[test]
    fn unrelated_departments_do_not_match() {
        assert!(!matches_suggestion("骨科", "妇科"));
        assert!(!matches_suggestion("耳鼻喉科", "心内科"));
    }

    #[test]
    fn empty_input_fails_open() {
        assert!(matches_suggestion("", "内科"));
        assert!(matches_suggestion("耳鼻喉科", "   "));
    }

    #[test]
    fn siblings_in_one_alias_group_match() {
        assert!(matches_suggestion("消化内科", "呼吸内科"));
        assert!(matches_suggestion("耳鼻喉科", "眼科"));
    }

    #[test]
    fn comparison_is_case_insensitive() {
        assert!(matches_suggestion("ENT", " ent "));
    }
}
