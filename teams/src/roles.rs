//! Standard delivery role catalog.

/// Definition used to seed a team's role set.
#[derive(Debug, Clone)]
pub struct StandardRole {
    pub role_id: &'static str,
    pub description: &'static str,
    pub suitable_personas: &'static [&'static str],
    pub priority: u8,
    pub is_required: bool,
}

/// The standard software-delivery roles. Teams can carry more, but these are
/// the ones the scaling plan and the access matrix know about.
pub const STANDARD_ROLES: &[StandardRole] = &[
    StandardRole {
        role_id: "Product Owner",
        description: "Defines requirements and priorities",
        suitable_personas: &["requirement_analyst"],
        priority: 10,
        is_required: true,
    },
    StandardRole {
        role_id: "Tech Lead",
        description: "Technical leadership and architecture decisions",
        suitable_personas: &["solution_architect"],
        priority: 10,
        is_required: true,
    },
    StandardRole {
        role_id: "Security Auditor",
        description: "Security review and compliance",
        suitable_personas: &["security_specialist"],
        priority: 9,
        is_required: true,
    },
    StandardRole {
        role_id: "DBA Specialist",
        description: "Database design and optimization",
        suitable_personas: &["backend_developer", "solution_architect", "data_engineer"],
        priority: 7,
        is_required: false,
    },
    StandardRole {
        role_id: "Frontend Lead",
        description: "Frontend architecture and implementation",
        suitable_personas: &["frontend_developer"],
        priority: 8,
        is_required: true,
    },
    StandardRole {
        role_id: "Backend Lead",
        description: "Backend architecture and implementation",
        suitable_personas: &["backend_developer"],
        priority: 8,
        is_required: true,
    },
    StandardRole {
        role_id: "DevOps Engineer",
        description: "Infrastructure and deployment",
        suitable_personas: &["devops_engineer"],
        priority: 8,
        is_required: true,
    },
    StandardRole {
        role_id: "QA Lead",
        description: "Test strategy and quality assurance",
        suitable_personas: &["qa_engineer"],
        priority: 8,
        is_required: true,
    },
    StandardRole {
        role_id: "UX Designer",
        description: "User experience and interface design",
        suitable_personas: &["ui_ux_designer"],
        priority: 7,
        is_required: false,
    },
    StandardRole {
        role_id: "Documentation Lead",
        description: "Technical documentation and knowledge management",
        suitable_personas: &["technical_writer"],
        priority: 5,
        is_required: false,
    },
    StandardRole {
        role_id: "Deployment Specialist",
        description: "Production deployment and release management",
        suitable_personas: &["deployment_specialist"],
        priority: 7,
        is_required: true,
    },
];

pub fn standard_role(role_id: &str) -> Option<&'static StandardRole> {
    STANDARD_ROLES.iter().find(|r| r.role_id == role_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_roles_have_personas() {
        for role in STANDARD_ROLES {
            assert!(!role.suitable_personas.is_empty(), "{}", role.role_id);
        }
        assert!(standard_role("Security Auditor").unwrap().is_required);
        assert!(!standard_role("UX Designer").unwrap().is_required);
    }
}
