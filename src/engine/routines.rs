use chrono::NaiveDateTime;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::ROUTINES_GENERATED_TOTAL;

use super::{Engine, EngineError};

fn check_template(template: &RoutineTemplate) -> Result<(), EngineError> {
    if template.title.trim().is_empty() {
        return Err(EngineError::InvalidInput("template title must not be empty".into()));
    }
    if template.title.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("template title too long"));
    }
    if let Some(d) = &template.description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if template.content.trim().is_empty() {
        return Err(EngineError::InvalidInput("template content must not be empty".into()));
    }
    if template.content.len() > MAX_CONTENT_LEN {
        return Err(EngineError::LimitExceeded("template content too long"));
    }
    if template.bmi_min > template.bmi_max {
        return Err(EngineError::InvalidInput(format!(
            "BMI range {}..{} is inverted",
            format_bmi(template.bmi_min),
            format_bmi(template.bmi_max)
        )));
    }
    Ok(())
}

impl Engine {
    // ── Templates ────────────────────────────────────────────────

    pub async fn create_routine_template(
        &self,
        template: RoutineTemplate,
    ) -> Result<RoutineTemplate, EngineError> {
        check_template(&template)?;
        let _registry = self.registry.lock().await;
        if self.templates.len() >= MAX_ROUTINE_TEMPLATES {
            return Err(EngineError::LimitExceeded("too many routine templates"));
        }
        if self.templates.contains_key(&template.id) {
            return Err(EngineError::AlreadyExists(format!("routine template {}", template.id)));
        }
        self.persist_registry(&Event::TemplateSaved {
            template: template.clone(),
        })
        .await?;
        Ok(template)
    }

    /// Routines already generated keep their own copy of the text.
    pub async fn update_routine_template(
        &self,
        template: RoutineTemplate,
    ) -> Result<RoutineTemplate, EngineError> {
        check_template(&template)?;
        let _registry = self.registry.lock().await;
        if !self.templates.contains_key(&template.id) {
            return Err(EngineError::NotFound(template.id));
        }
        self.persist_registry(&Event::TemplateSaved {
            template: template.clone(),
        })
        .await?;
        Ok(template)
    }

    pub async fn delete_routine_template(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        if !self.templates.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_registry(&Event::TemplateDeleted { id }).await
    }

    pub fn get_routine_template(&self, id: Ulid) -> Result<RoutineTemplate, EngineError> {
        self.templates
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// All templates, by goal then lower BMI bound.
    pub fn list_routine_templates(&self) -> Vec<RoutineTemplate> {
        let mut templates: Vec<RoutineTemplate> =
            self.templates.iter().map(|t| t.value().clone()).collect();
        templates.sort_by_key(|t| (t.goal, t.bmi_min, t.id));
        templates
    }

    /// The template for `goal` whose range covers `bmi`. When several do, the
    /// one with the lowest lower bound wins.
    pub fn matching_template(&self, goal: Goal, bmi: u32) -> Option<RoutineTemplate> {
        self.templates
            .iter()
            .filter(|t| t.goal == goal && (t.bmi_min..=t.bmi_max).contains(&bmi))
            .min_by_key(|t| (t.bmi_min, t.id))
            .map(|t| t.value().clone())
    }

    // ── Routines ─────────────────────────────────────────────────

    /// Hand `member_id` a routine built from the template matching their goal
    /// and current BMI. Only the member's assigned instructor may do this, and
    /// the member needs weight and height on record.
    ///
    /// The title is the template's, stamped with `at`. One instructor cannot give
    /// the same member two routines with the same title.
    pub async fn generate_routine(
        &self,
        instructor_id: Ulid,
        member_id: Ulid,
        at: NaiveDateTime,
    ) -> Result<Routine, EngineError> {
        let _registry = self.registry.lock().await;
        self.require_instructor(instructor_id)?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let mut guard = ms.write().await;
        if !self.members.contains_key(&member_id) {
            return Err(EngineError::NotFound(member_id));
        }

        let fitness = &guard.member.profile.fitness;
        if fitness.instructor_id != Some(instructor_id) {
            return Err(EngineError::InvalidInput(format!(
                "member {member_id} is not assigned to instructor {instructor_id}"
            )));
        }
        let goal = fitness.goal;
        let bmi = fitness.bmi().ok_or_else(|| {
            EngineError::InvalidInput("weight and height are needed to generate a routine".into())
        })?;
        let template = self
            .matching_template(goal, bmi)
            .ok_or(EngineError::NoMatchingTemplate { goal, bmi })?;

        let title = format!("{} - {}", template.title, at.format("%d/%m/%Y %H:%M:%S"));
        if guard
            .routines
            .values()
            .any(|r| r.instructor_id == instructor_id && r.title == title)
        {
            return Err(EngineError::AlreadyExists(format!("routine titled {title}")));
        }
        if guard.routines.len() >= MAX_ROUTINES_PER_MEMBER {
            return Err(EngineError::LimitExceeded("too many routines"));
        }

        let routine = Routine {
            id: Ulid::new(),
            instructor_id,
            member_id,
            title,
            description: template.description,
            content: template.content,
            bmi,
            assigned_at: at,
            active: true,
        };
        let event = Event::RoutineSaved {
            routine: routine.clone(),
        };
        self.persist_and_apply_member(&mut guard, &event).await?;
        metrics::counter!(ROUTINES_GENERATED_TOTAL).increment(1);
        info!(
            "instructor {instructor_id} gave member {member_id} routine {} at BMI {}",
            routine.id,
            format_bmi(bmi)
        );
        Ok(routine)
    }

    pub async fn set_routine_active(&self, id: Ulid, active: bool) -> Result<Routine, EngineError> {
        let member_id = self.member_for_routine(&id).ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        let current = guard.routines.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.active == active {
            return Ok(current);
        }
        let routine = Routine { active, ..current };
        let event = Event::RoutineSaved {
            routine: routine.clone(),
        };
        self.persist_and_apply_member(&mut guard, &event).await?;
        Ok(routine)
    }

    pub async fn delete_routine(&self, id: Ulid) -> Result<(), EngineError> {
        let member_id = self.member_for_routine(&id).ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        let instructor_id = guard
            .routines
            .get(&id)
            .map(|r| r.instructor_id)
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::RoutineRemoved {
            id,
            member_id,
            instructor_id,
        };
        self.persist_and_apply_member(&mut guard, &event).await
    }

    pub async fn get_routine(&self, id: Ulid) -> Result<Routine, EngineError> {
        let member_id = self.member_for_routine(&id).ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let routine = ms.read().await.routines.get(&id).cloned();
        routine.ok_or(EngineError::NotFound(id))
    }

    /// A member's routines, newest first.
    pub async fn routines_of(&self, member_id: Ulid) -> Result<Vec<Routine>, EngineError> {
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let mut routines: Vec<Routine> = ms.read().await.routines.values().cloned().collect();
        routines.sort_by(|a, b| (b.assigned_at, b.id).cmp(&(a.assigned_at, a.id)));
        Ok(routines)
    }

    /// Members assigned to an instructor, by first then last name.
    pub async fn students_of(&self, instructor_id: Ulid) -> Result<Vec<Student>, EngineError> {
        self.require_instructor(instructor_id)?;
        let mut students = Vec::new();
        for member_id in Self::sorted_ids(&self.members) {
            let Some(ms) = self.get_member_state(&member_id) else { continue };
            let guard = ms.read().await;
            let profile = &guard.member.profile;
            if profile.fitness.instructor_id == Some(instructor_id) {
                students.push((
                    (profile.first_name.clone(), profile.last_name.clone()),
                    Student {
                        member_id,
                        name: profile.display_name(),
                        goal: profile.fitness.goal,
                        bmi: profile.fitness.bmi(),
                    },
                ));
            }
        }
        students.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(students.into_iter().map(|(_, s)| s).collect())
    }
}
